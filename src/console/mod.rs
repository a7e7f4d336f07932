//! Command/response consoles on UUT firmware.
//!
//! A [`Console`] is a port, a [`FrameCodec`] chosen by [`Dialect`], and a
//! [`ParameterTable`]. Parameter reads and writes render a command from the
//! table and go through [`Console::action`], the single exchange path.

pub mod codec;
pub mod params;
pub mod tunnel;

pub use codec::{Dialect, EchoCheck, FrameCodec, LinePromptCodec, PromptCodec};
pub use params::{Coding, HexStyle, OverrideState, ParamValue, Parameter, ParameterTable};
pub use tunnel::CanTunnel;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, info};

use crate::serial::{self, ByteStream, SerialError};
use crate::timing::{system_clock, SharedClock};

pub const UNLOCK_COMMAND: &str = "$DEADBEA7 UNLOCK";
pub const NV_DEFAULT_COMMAND: &str = "NV-DEFAULT";
pub const NV_WRITE_COMMAND: &str = "NV-WRITE";
pub const RESTART_COMMAND: &str = "RESTART";
pub const SW_VERSION_COMMAND: &str = "SW-VERSION?";
pub const STATUS_KEY: &str = "STATUS";

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error(transparent)]
    Serial(#[from] SerialError),
    /// Wrong number of reply lines, or no reply in time.
    #[error("response error on {command:?}: {reason}")]
    Response { command: String, reason: String },
    /// The echo did not match what was sent.
    #[error("command error on {command:?}: sent {sent:?}, echoed {echoed:?}")]
    Command {
        command: String,
        sent: String,
        echoed: String,
    },
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    #[error("parameter {0} is not readable")]
    NotReadable(String),
    #[error("parameter {0} is not writable")]
    NotWritable(String),
    #[error("parameter {key}: value {value} has the wrong type")]
    WrongValueType { key: String, value: String },
    #[error("parameter {key}: {value} outside [{min}, {max}]")]
    OutOfRange { key: String, value: f64, min: f64, max: f64 },
    #[error("parameter {key}: cannot parse reply {reply:?}")]
    Parse { key: String, reply: String },
    #[error("console {0} is not open")]
    NotOpen(String),
}

impl ConsoleError {
    /// Framing and timeout failures, the ones a measurement records as a
    /// FAIL instead of aborting the step.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ConsoleError::Response { .. } | ConsoleError::Command { .. } | ConsoleError::Parse { .. }
        )
    }
}

/// Reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Empty,
    Line(String),
    Lines(Vec<String>),
}

impl Response {
    pub fn lines(&self) -> Vec<String> {
        match self {
            Response::Empty => Vec::new(),
            Response::Line(line) => vec![line.clone()],
            Response::Lines(lines) => lines.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Response::Empty => 0,
            Response::Line(_) => 1,
            Response::Lines(lines) => lines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<String>> for Response {
    fn from(mut lines: Vec<String>) -> Self {
        match lines.len() {
            0 => Response::Empty,
            1 => Response::Line(lines.remove(0)),
            _ => Response::Lines(lines),
        }
    }
}

bitflags! {
    /// Known bits of the firmware `STATUS` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const CAN_BOUND = 1 << 28;
        const CAN_PRINT = 1 << 29;
        const TEST_MODE = 1 << 31;
    }
}

/// Hardware revision triple written by [`Console::brand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: String,
}

impl HwVersion {
    pub fn new(major: u32, minor: u32, revision: &str) -> Self {
        Self {
            major,
            minor,
            revision: revision.to_string(),
        }
    }
}

pub struct Console {
    name: String,
    port: Box<dyn ByteStream>,
    dialect: Dialect,
    codec: Box<dyn FrameCodec>,
    params: ParameterTable,
    clock: SharedClock,
    fail_on_error: bool,
    open: bool,
}

pub type SharedConsole = Arc<Mutex<Console>>;

impl Console {
    pub fn new(name: &str, port: Box<dyn ByteStream>, dialect: Dialect, params: ParameterTable) -> Self {
        let codec = dialect.codec();
        Self {
            name: name.to_string(),
            port,
            dialect,
            codec,
            params,
            clock: system_clock(),
            fail_on_error: true,
            open: false,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn shared(self) -> SharedConsole {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn params(&self) -> &ParameterTable {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterTable {
        &mut self.params
    }

    /// When false, protocol errors propagate out of console sensors instead
    /// of becoming a FAIL result.
    pub fn measurement_fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    pub fn set_measurement_fail_on_error(&mut self, fail: bool) {
        self.fail_on_error = fail;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self) -> Result<(), ConsoleError> {
        if self.open {
            return Ok(());
        }
        self.port.open()?;
        self.codec.setup(self.port.as_mut())?;
        self.open = true;
        info!(console = %self.name, dialect = ?self.dialect, "console opened");
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), ConsoleError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.port.close()?;
        info!(console = %self.name, "console closed");
        Ok(())
    }

    /// Send `command`, wait `delay`, and read the reply, which must have
    /// exactly `expected` lines.
    pub fn action(&mut self, command: &str, delay: Duration, expected: usize) -> Result<Response, ConsoleError> {
        let lines = self.exchange(command, delay)?;
        if lines.len() != expected {
            return Err(ConsoleError::Response {
                command: command.to_string(),
                reason: format!("expected {} lines, got {}: {:?}", expected, lines.len(), lines),
            });
        }
        Ok(Response::from(lines))
    }

    /// Send `command` and return however many lines came back.
    pub fn query(&mut self, command: &str) -> Result<Vec<String>, ConsoleError> {
        self.exchange(command, Duration::ZERO)
    }

    fn exchange(&mut self, command: &str, delay: Duration) -> Result<Vec<String>, ConsoleError> {
        if !self.open {
            return Err(ConsoleError::NotOpen(self.name.clone()));
        }
        debug!(console = %self.name, command, "send");
        self.codec.send(self.port.as_mut(), command)?;
        self.clock.sleep(delay);
        let lines = self.codec.receive(self.port.as_mut(), command)?;
        debug!(console = %self.name, ?lines, "receive");
        Ok(lines)
    }

    /// One raw line from the port, or `None` when the port goes quiet.
    pub fn read_line(&mut self) -> Result<Option<String>, ConsoleError> {
        if !self.open {
            return Err(ConsoleError::NotOpen(self.name.clone()));
        }
        match serial::read_line(self.port.as_mut()) {
            Ok(line) => Ok(Some(line)),
            Err(SerialError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn parameter(&self, key: &str) -> Result<Parameter, ConsoleError> {
        self.params
            .get(key)
            .cloned()
            .ok_or_else(|| ConsoleError::UnknownParameter(key.to_string()))
    }

    pub fn get(&mut self, key: &str) -> Result<ParamValue, ConsoleError> {
        let param = self.parameter(key)?;
        if let Coding::Raw(function) = &param.coding {
            return function(self);
        }
        if !param.readable {
            return Err(ConsoleError::NotReadable(key.to_string()));
        }
        let command = param.read_command();
        let reply = match self.action(&command, Duration::ZERO, param.read_expected)? {
            Response::Empty => String::new(),
            Response::Line(line) => line,
            Response::Lines(lines) => lines.join("\n"),
        };
        param.decode(key, &reply)
    }

    pub fn set(&mut self, key: &str, value: ParamValue) -> Result<(), ConsoleError> {
        let param = self.parameter(key)?;
        let command = param.encode(key, &value)?;
        self.action(&command, Duration::ZERO, param.write_expected)?;
        Ok(())
    }

    pub fn get_string(&mut self, key: &str) -> Result<String, ConsoleError> {
        match self.get(key)? {
            ParamValue::Str(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    pub fn get_bool(&mut self, key: &str) -> Result<bool, ConsoleError> {
        match self.get(key)? {
            ParamValue::Bool(b) => Ok(b),
            other => Err(ConsoleError::WrongValueType {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn get_f64(&mut self, key: &str) -> Result<f64, ConsoleError> {
        match self.get(key)? {
            ParamValue::Float(v) => Ok(v),
            other => Err(ConsoleError::WrongValueType {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn get_hex(&mut self, key: &str) -> Result<u32, ConsoleError> {
        match self.get(key)? {
            ParamValue::Hex(v) => Ok(v),
            other => Err(ConsoleError::WrongValueType {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    pub fn set_string(&mut self, key: &str, value: &str) -> Result<(), ConsoleError> {
        self.set(key, ParamValue::Str(value.to_string()))
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<(), ConsoleError> {
        self.set(key, ParamValue::Bool(value))
    }

    pub fn set_f64(&mut self, key: &str, value: f64) -> Result<(), ConsoleError> {
        self.set(key, ParamValue::Float(value))
    }

    pub fn set_hex(&mut self, key: &str, value: u32) -> Result<(), ConsoleError> {
        self.set(key, ParamValue::Hex(value))
    }

    pub fn set_override(&mut self, key: &str, state: OverrideState) -> Result<(), ConsoleError> {
        self.set(key, ParamValue::Override(state))
    }

    pub fn unlock(&mut self) -> Result<(), ConsoleError> {
        self.action(UNLOCK_COMMAND, Duration::ZERO, 0).map(|_| ())
    }

    pub fn nv_default(&mut self) -> Result<(), ConsoleError> {
        self.action(NV_DEFAULT_COMMAND, Duration::ZERO, 0).map(|_| ())
    }

    pub fn nv_write(&mut self) -> Result<(), ConsoleError> {
        self.action(NV_WRITE_COMMAND, Duration::ZERO, 0).map(|_| ())
    }

    /// Reboot the unit. `delay` covers the boot banner before the prompt.
    pub fn restart(&mut self, delay: Duration) -> Result<(), ConsoleError> {
        self.action(RESTART_COMMAND, delay, 0).map(|_| ())
    }

    pub fn firmware_version(&mut self) -> Result<String, ConsoleError> {
        let lines = self.query(SW_VERSION_COMMAND)?;
        lines.into_iter().next().ok_or_else(|| ConsoleError::Response {
            command: SW_VERSION_COMMAND.to_string(),
            reason: "no version line".to_string(),
        })
    }

    /// Write hardware version and serial number, then install factory
    /// defaults and commit. Repeating it leaves the same flash state.
    pub fn brand(&mut self, hw: &HwVersion, serial: &str) -> Result<(), ConsoleError> {
        info!(console = %self.name, major = hw.major, minor = hw.minor, revision = %hw.revision, serial, "branding");
        self.unlock()?;
        let hw_command = format!("{} {} \"{} SET-HW-VER", hw.major, hw.minor, hw.revision);
        self.action(&hw_command, Duration::ZERO, 0)?;
        let serial_command = format!("\"{} SET-SERIAL-ID", serial);
        self.action(&serial_command, Duration::ZERO, 0)?;
        self.nv_default()?;
        self.nv_write()
    }

    pub fn status(&mut self) -> Result<StatusFlags, ConsoleError> {
        Ok(StatusFlags::from_bits_retain(self.get_hex(STATUS_KEY)?))
    }

    fn update_status(&mut self, flag: StatusFlags, on: bool) -> Result<(), ConsoleError> {
        let mut status = self.status()?;
        status.set(flag, on);
        self.set_hex(STATUS_KEY, status.bits())
    }

    pub fn test_mode(&mut self, on: bool) -> Result<(), ConsoleError> {
        self.update_status(StatusFlags::TEST_MODE, on)
    }

    pub fn can_print(&mut self, on: bool) -> Result<(), ConsoleError> {
        self.update_status(StatusFlags::CAN_PRINT, on)
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("name", &self.name)
            .field("port", &self.port.name())
            .field("dialect", &self.dialect)
            .field("open", &self.open)
            .finish()
    }
}
