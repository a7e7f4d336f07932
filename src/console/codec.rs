//! Framing strategies for the console dialects.
//!
//! A [`FrameCodec`] decides how command bytes go out and how reply bytes are
//! split into lines. Dialects 1 to 3 share the `\r> ` prompt framing and
//! differ only in how the echo is verified; dialect 4 and the second
//! generation console reprogram the prompt into a line of its own.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ConsoleError;
use crate::serial::{self, ByteStream, SerialError};

pub const COMMAND_TERMINATOR: u8 = b'\r';
pub const GEN2_PROMPT: &str = "OK";
pub const CAN_CHUNK: usize = 8;

/// Selects the framing strategy. Required when a console is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// LPC111x bulk UART: whole command, echo read back after it.
    BulkUart,
    /// LPC1519 software UART: one byte at a time, each echo checked.
    BadUart,
    /// CAN packet transport: 8-byte chunks, each echo checked.
    CanPacket,
    /// LPC111x buffered UART, prompt reprogrammed to end with `\n`.
    BufferedUart { prompt: String },
    /// Newer firmware honouring `PROMPT` and `ECHO`.
    Gen2,
}

impl Dialect {
    pub fn codec(&self) -> Box<dyn FrameCodec> {
        match self {
            Dialect::BulkUart => Box::new(PromptCodec::new(EchoCheck::Whole)),
            Dialect::BadUart => Box::new(PromptCodec::new(EchoCheck::PerByte)),
            Dialect::CanPacket => Box::new(PromptCodec::new(EchoCheck::Chunked(CAN_CHUNK))),
            Dialect::BufferedUart { prompt } => Box::new(LinePromptCodec::buffered(prompt)),
            Dialect::Gen2 => Box::new(LinePromptCodec::gen2()),
        }
    }
}

pub trait FrameCodec: Send {
    /// Prepare the firmware after the port opens.
    fn setup(&mut self, _port: &mut dyn ByteStream) -> Result<(), ConsoleError> {
        Ok(())
    }

    /// Transmit `command` and its terminator.
    fn send(&mut self, port: &mut dyn ByteStream, command: &str) -> Result<(), ConsoleError>;

    /// Collect the reply lines to `command`.
    fn receive(&mut self, port: &mut dyn ByteStream, command: &str) -> Result<Vec<String>, ConsoleError>;
}

pub(crate) fn timeout_as_response(command: &str, err: SerialError) -> ConsoleError {
    match err {
        SerialError::Timeout { received } => ConsoleError::Response {
            command: command.to_string(),
            reason: format!("timeout, received {:?}", received),
        },
        other => ConsoleError::Serial(other),
    }
}

fn echo_mismatch(command: &str, expected: &[u8], echoed: &[u8]) -> ConsoleError {
    if echoed.is_empty() {
        return ConsoleError::Response {
            command: command.to_string(),
            reason: "timeout waiting for echo".to_string(),
        };
    }
    ConsoleError::Command {
        command: command.to_string(),
        sent: String::from_utf8_lossy(expected).into_owned(),
        echoed: String::from_utf8_lossy(echoed).into_owned(),
    }
}

fn verify_echo(port: &mut dyn ByteStream, command: &str, sent: &[u8]) -> Result<(), ConsoleError> {
    let echoed = serial::read_exact_bytes(port, sent.len())?;
    if echoed != sent {
        return Err(echo_mismatch(command, sent, &echoed));
    }
    Ok(())
}

pub(crate) fn ends_with_prompt(data: &[u8]) -> bool {
    data.ends_with(b"\r> ") || data.ends_with(b"\n> ")
}

/// Split a prompt-terminated buffer into response lines.
pub fn parse_prompt_response(raw: &str) -> Vec<String> {
    let body = raw.trim_start_matches('\r');
    let body = body.strip_prefix(" -> ").unwrap_or(body);
    let body = body.strip_suffix("> ").unwrap_or(body);
    body.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoCheck {
    Whole,
    PerByte,
    Chunked(usize),
}

/// Dialects 1 to 3: reply ends at the `> ` prompt.
#[derive(Debug)]
pub struct PromptCodec {
    echo: EchoCheck,
}

impl PromptCodec {
    pub fn new(echo: EchoCheck) -> Self {
        Self { echo }
    }
}

impl FrameCodec for PromptCodec {
    fn send(&mut self, port: &mut dyn ByteStream, command: &str) -> Result<(), ConsoleError> {
        let bytes = command.as_bytes();
        match self.echo {
            EchoCheck::Whole => {
                let mut line = bytes.to_vec();
                line.push(COMMAND_TERMINATOR);
                port.write(&line)?;
                return Ok(());
            }
            EchoCheck::PerByte => {
                for byte in bytes.chunks(1) {
                    port.write(byte)?;
                    verify_echo(port, command, byte)?;
                }
            }
            EchoCheck::Chunked(size) => {
                for chunk in bytes.chunks(size.max(1)) {
                    port.write(chunk)?;
                    verify_echo(port, command, chunk)?;
                }
            }
        }
        port.write(&[COMMAND_TERMINATOR])?;
        Ok(())
    }

    fn receive(&mut self, port: &mut dyn ByteStream, command: &str) -> Result<Vec<String>, ConsoleError> {
        if self.echo == EchoCheck::Whole {
            verify_echo(port, command, command.as_bytes())?;
        }
        let raw = serial::read_until_match(port, ends_with_prompt).map_err(|e| timeout_as_response(command, e))?;
        let text = String::from_utf8_lossy(&raw);
        debug!(command, reply = %text.escape_debug(), "prompt reply");
        Ok(parse_prompt_response(&text))
    }
}

/// Dialect 4 and Gen2: the prompt is a line of its own.
#[derive(Debug)]
pub struct LinePromptCodec {
    prompt: String,
    echoes: bool,
}

impl LinePromptCodec {
    pub fn buffered(prompt: &str) -> Self {
        Self {
            prompt: prompt.trim().to_string(),
            echoes: true,
        }
    }

    pub fn gen2() -> Self {
        Self {
            prompt: GEN2_PROMPT.to_string(),
            echoes: false,
        }
    }

    fn read_lines(&self, port: &mut dyn ByteStream, command: &str) -> Result<Vec<String>, ConsoleError> {
        let mut lines = Vec::new();
        loop {
            let line = serial::read_line(port).map_err(|e| timeout_as_response(command, e))?;
            let line = line.trim();
            if line == self.prompt {
                return Ok(lines);
            }
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
    }

    fn exchange(&self, port: &mut dyn ByteStream, command: &str) -> Result<Vec<String>, ConsoleError> {
        let mut line = command.as_bytes().to_vec();
        line.push(COMMAND_TERMINATOR);
        port.write(&line)?;
        self.read_lines(port, command)
    }
}

impl FrameCodec for LinePromptCodec {
    fn setup(&mut self, port: &mut dyn ByteStream) -> Result<(), ConsoleError> {
        // Firmware expands the literal `\n` in the new prompt.
        let command = format!("\"{}\\n\" PROMPT", self.prompt);
        self.exchange(port, &command)?;
        if !self.echoes {
            self.exchange(port, "0 ECHO")?;
        }
        Ok(())
    }

    fn send(&mut self, port: &mut dyn ByteStream, command: &str) -> Result<(), ConsoleError> {
        let mut line = command.as_bytes().to_vec();
        line.push(COMMAND_TERMINATOR);
        port.write(&line)?;
        Ok(())
    }

    fn receive(&mut self, port: &mut dyn ByteStream, command: &str) -> Result<Vec<String>, ConsoleError> {
        let mut lines = self.read_lines(port, command)?;
        if self.echoes && !lines.is_empty() {
            let first = lines.remove(0);
            let Some(rest) = first.strip_prefix(command) else {
                return Err(ConsoleError::Command {
                    command: command.to_string(),
                    sent: command.to_string(),
                    echoed: first,
                });
            };
            let rest = rest.trim_start_matches('\r');
            let rest = rest.strip_prefix(" -> ").unwrap_or(rest).trim();
            if !rest.is_empty() {
                lines.insert(0, rest.to_string());
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prompt_response() {
        assert_eq!(parse_prompt_response("\r001EC030BC15\r\n> "), vec!["001EC030BC15"]);
        assert_eq!(parse_prompt_response(" -> 12\r\n13\r\n> "), vec!["12", "13"]);
        assert!(parse_prompt_response("\r> ").is_empty());
    }

    #[test]
    fn test_prompt_detection() {
        assert!(ends_with_prompt(b"abc\r> "));
        assert!(ends_with_prompt(b"abc\n> "));
        assert!(!ends_with_prompt(b"a> b"));
    }
}
