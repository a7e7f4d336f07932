//! Byte-stream ports.
//!
//! Everything that talks to a UUT goes through [`ByteStream`]. Two
//! implementations are selected at construction: [`HardwareSerial`] drives a
//! real UART through the `serialport` crate, [`SimSerial`] serves bytes that
//! a test staged in advance and captures whatever the program wrote. At the
//! byte level the two are indistinguishable apart from timing.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use static_assertions::const_assert;
use thiserror::Error;
use tracing::{debug, info};

/// Input-buffer entry marking a flush barrier. Bytes occupy 0..=255.
pub const FLUSH: i16 = -1;

const_assert!(FLUSH < 0);

pub const DEFAULT_BAUD: u32 = 115_200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),
    #[error("port {0} is not open")]
    NotOpen(String),
    #[error("timeout, received {received:?}")]
    Timeout { received: String },
    #[error("tunnel error: {0}")]
    Tunnel(String),
}

/// The byte-stream interface shared by real, simulated and tunnelled ports.
pub trait ByteStream: Send {
    fn name(&self) -> &str;
    fn open(&mut self) -> Result<(), SerialError>;
    fn close(&mut self) -> Result<(), SerialError>;
    fn is_open(&self) -> bool;

    /// Read up to `n` bytes. An empty result means the read timed out.
    fn read(&mut self, n: usize) -> Result<Vec<u8>, SerialError>;
    fn write(&mut self, data: &[u8]) -> Result<(), SerialError>;
    fn flush_input(&mut self) -> Result<(), SerialError>;
    fn in_waiting(&mut self) -> Result<usize, SerialError>;

    fn set_rts(&mut self, _level: bool) -> Result<(), SerialError> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), SerialError> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), SerialError> {
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        false
    }
}

/// Read exactly `n` bytes, or fewer if the port times out first.
pub fn read_exact_bytes(port: &mut dyn ByteStream, n: usize) -> Result<Vec<u8>, SerialError> {
    let mut data = Vec::with_capacity(n);
    while data.len() < n {
        let chunk = port.read(n - data.len())?;
        if chunk.is_empty() {
            break;
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// Read byte by byte until `matches` accepts the accumulated buffer.
pub fn read_until_match<F>(port: &mut dyn ByteStream, mut matches: F) -> Result<Vec<u8>, SerialError>
where
    F: FnMut(&[u8]) -> bool,
{
    let mut data = Vec::new();
    loop {
        let byte = port.read(1)?;
        if byte.is_empty() {
            return Err(SerialError::Timeout {
                received: String::from_utf8_lossy(&data).into_owned(),
            });
        }
        data.extend_from_slice(&byte);
        if matches(&data) {
            return Ok(data);
        }
    }
}

/// Read until the buffer ends with `terminator` (terminator included).
pub fn read_until(port: &mut dyn ByteStream, terminator: &[u8]) -> Result<Vec<u8>, SerialError> {
    read_until_match(port, |data| data.ends_with(terminator))
}

/// Read one `\n`-terminated line, trimmed of line endings.
pub fn read_line(port: &mut dyn ByteStream) -> Result<String, SerialError> {
    let raw = read_until(port, b"\n")?;
    Ok(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string())
}

#[derive(Debug, Default)]
struct SimState {
    input: VecDeque<i16>,
    output: Vec<u8>,
    echo: bool,
    open: bool,
    open_count: u32,
    rts: Vec<bool>,
    dtr: Vec<bool>,
}

/// Simulated port. Clones share the same buffers, so a test can keep one
/// handle to stage responses while a console owns another.
#[derive(Debug, Clone)]
pub struct SimSerial {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimSerial {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage input: `preflush` barriers, the bytes of `data`, then
    /// `postflush` barriers. With `priority` the block goes to the front.
    pub fn puts(&self, data: &[u8], preflush: usize, postflush: usize, priority: bool) {
        let mut block: Vec<i16> = Vec::with_capacity(preflush + data.len() + postflush);
        block.extend(std::iter::repeat(FLUSH).take(preflush));
        block.extend(data.iter().map(|&b| i16::from(b)));
        block.extend(std::iter::repeat(FLUSH).take(postflush));

        let mut state = self.lock();
        if priority {
            for entry in block.into_iter().rev() {
                state.input.push_front(entry);
            }
        } else {
            state.input.extend(block);
        }
    }

    /// Shorthand for `puts(text, 0, 0, false)`.
    pub fn stage(&self, text: &str) {
        self.puts(text.as_bytes(), 0, 0, false);
    }

    /// Shorthand for staging text followed by one flush barrier.
    pub fn stage_then_flush(&self, text: &str) {
        self.puts(text.as_bytes(), 0, 1, false);
    }

    /// Loop written bytes back to the front of the input, like a UART echo.
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.lock().output.clone()
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.lock().output).into_owned()
    }

    /// Drain the output capture.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().output)
    }

    /// Remaining staged input, barriers included.
    pub fn pending(&self) -> usize {
        self.lock().input.len()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    pub fn rts_history(&self) -> Vec<bool> {
        self.lock().rts.clone()
    }

    pub fn dtr_history(&self) -> Vec<bool> {
        self.lock().dtr.clone()
    }
}

impl ByteStream for SimSerial {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SerialError> {
        let mut state = self.lock();
        state.open = true;
        state.open_count += 1;
        debug!(port = %self.name, "simulated port opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SerialError> {
        self.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, SerialError> {
        let mut state = self.lock();
        let mut data = Vec::with_capacity(n);
        while data.len() < n {
            match state.input.pop_front() {
                Some(FLUSH) => break,
                Some(entry) => data.push(entry as u8),
                None => break,
            }
        }
        Ok(data)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let mut state = self.lock();
        state.output.extend_from_slice(data);
        if state.echo {
            for &b in data.iter().rev() {
                state.input.push_front(i16::from(b));
            }
        }
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), SerialError> {
        let mut state = self.lock();
        match state.input.iter().position(|&entry| entry == FLUSH) {
            Some(index) => {
                state.input.drain(..=index);
            }
            None => state.input.clear(),
        }
        Ok(())
    }

    fn in_waiting(&mut self) -> Result<usize, SerialError> {
        Ok(self.lock().input.iter().filter(|&&entry| entry != FLUSH).count())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
        self.lock().rts.push(level);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
        self.lock().dtr.push(level);
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

/// A real UART.
pub struct HardwareSerial {
    name: String,
    device: String,
    baud: u32,
    timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl HardwareSerial {
    pub fn new(name: &str, device: &str, baud: u32, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            baud,
            timeout,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, SerialError> {
        let name = &self.name;
        self.port.as_mut().ok_or_else(|| SerialError::NotOpen(name.clone()))
    }
}

impl std::fmt::Debug for HardwareSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSerial")
            .field("name", &self.name)
            .field("device", &self.device)
            .field("baud", &self.baud)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl ByteStream for HardwareSerial {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SerialError> {
        if self.port.is_none() {
            let port = serialport::new(self.device.as_str(), self.baud)
                .timeout(self.timeout)
                .open()?;
            info!(port = %self.name, device = %self.device, baud = self.baud, "serial port opened");
            self.port = Some(port);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SerialError> {
        if self.port.take().is_some() {
            info!(port = %self.name, "serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, SerialError> {
        let port = self.port()?;
        let mut buf = vec![0u8; n];
        match port.read(&mut buf) {
            Ok(count) => {
                buf.truncate(count);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), SerialError> {
        self.port()?.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn in_waiting(&mut self) -> Result<usize, SerialError> {
        Ok(self.port()?.bytes_to_read()? as usize)
    }

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
        self.port()?.write_request_to_send(level)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
        self.port()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialError> {
        self.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout)?;
        }
        Ok(())
    }
}
