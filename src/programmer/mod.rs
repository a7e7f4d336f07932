//! Device programmers.
//!
//! Every backend is wrapped the same way: [`Programmer::program`] runs the
//! backend, stores `"ok"` or `"Error N"` in a mirror sensor, and
//! [`Programmer::result_check`] measures that mirror against `^ok$`. A
//! programming step therefore yields an ordinary pass/fail reading.

pub mod avr;
pub mod ihex;
pub mod isplpc;
pub mod nordic;
pub mod vendor;

pub use avr::{AvrBackend, DeviceInfo, SimUpdi, UpdiError, UpdiLink};
pub use ihex::{HexError, HexImage};
pub use isplpc::{BootMethod, IspError, IspLpcBackend, IspOptions};
pub use nordic::NordicBackend;
pub use vendor::{JLinkBackend, PicBackend};

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::limits::{Limit, LimitError};
use crate::measurement::{Measurement, MeasurementError, MeasurementResult};
use crate::sensors::instrument::{lock, InstrumentError};
use crate::sensors::{self, MirrorSensor};
use crate::serial::SerialError;
use crate::timing::Clock;

pub const PROGRAM_OK: &str = "ok";
pub const DEFAULT_PROGRAMMER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProgrammerError {
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error(transparent)]
    Isp(#[from] IspError),
    #[error(transparent)]
    Updi(#[from] UpdiError),
    #[error(transparent)]
    Hex(#[from] HexError),
    #[error(transparent)]
    Relay(#[from] InstrumentError),
    #[error(transparent)]
    Limit(#[from] LimitError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("verification failed at 0x{address:06X}: expected 0x{expected:02X}, read 0x{found:02X}")]
    Verification { address: u32, expected: u8, found: u8 },
    #[error("{tool} exited with status {code}")]
    Exit { tool: String, code: i32 },
    #[error("{tool} timed out after {seconds} s")]
    Timeout { tool: String, seconds: u64 },
    #[error("runner: {0}")]
    Runner(String),
    #[error("programming worker panicked")]
    Worker,
    #[error("programming was not started")]
    NotStarted,
}

impl ProgrammerError {
    /// The number reported in `"Error N"`.
    pub fn code(&self) -> i32 {
        match self {
            ProgrammerError::Exit { code, .. } => *code,
            ProgrammerError::Isp(IspError::Return { code, .. }) => *code as i32,
            ProgrammerError::Timeout { .. } => -1,
            ProgrammerError::Verification { .. } => -2,
            _ => -3,
        }
    }
}

/// The outcome text stored in a programmer's mirror sensor.
pub fn outcome_text(outcome: &Result<(), ProgrammerError>) -> String {
    match outcome {
        Ok(()) => PROGRAM_OK.to_string(),
        Err(e) => format!("Error {}", e.code()),
    }
}

/// One device-specific flashing method.
pub trait ProgrammerBackend: Send {
    fn name(&self) -> &str;
    /// Start programming. May return before the device is done.
    fn begin(&mut self) -> Result<(), ProgrammerError>;
    /// Block until the work started by `begin` has finished.
    fn wait(&mut self) -> Result<(), ProgrammerError>;
}

pub struct Programmer {
    name: String,
    backend: Box<dyn ProgrammerBackend>,
    mirror: MirrorSensor,
    measurement: Measurement,
    started: bool,
}

impl Programmer {
    pub fn new(name: &str, backend: Box<dyn ProgrammerBackend>) -> Result<Self, ProgrammerError> {
        let mirror = MirrorSensor::new(&format!("{}Result", name));
        let limit = Limit::regex(&format!("{}Ok", name), "^ok$")?
            .with_doc("Programming succeeded")
            .shared();
        let measurement = Measurement::new(name, limit, sensors::shared(mirror.clone()));
        Ok(Self {
            name: name.to_string(),
            backend,
            mirror,
            measurement,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mirror(&self) -> &MirrorSensor {
        &self.mirror
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }

    fn store(&self, outcome: &Result<(), ProgrammerError>) -> String {
        let text = outcome_text(outcome);
        match outcome {
            Ok(()) => info!(programmer = %self.name, backend = self.backend.name(), "programming ok"),
            Err(e) => warn!(programmer = %self.name, error = %e, "programming failed"),
        }
        self.mirror.store(text.as_str());
        text
    }

    pub fn program_begin(&mut self) {
        info!(programmer = %self.name, backend = self.backend.name(), "programming started");
        match self.backend.begin() {
            Ok(()) => self.started = true,
            Err(e) => {
                self.started = false;
                self.store(&Err(e));
            }
        }
    }

    /// Returns the stored outcome text, or `None` if `program_begin`
    /// already recorded a failure.
    pub fn program_wait(&mut self) -> Option<String> {
        if !self.started {
            return None;
        }
        self.started = false;
        let outcome = self.backend.wait();
        Some(self.store(&outcome))
    }

    pub fn program(&mut self) {
        self.program_begin();
        self.program_wait();
    }

    pub fn result_check(&self, clock: &dyn Clock) -> Result<MeasurementResult, MeasurementError> {
        self.measurement.measure(clock)
    }
}

impl fmt::Debug for Programmer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Programmer")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// A command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

pub trait CommandRunner: Send {
    /// Exit code, or `None` when the command outlived `timeout`.
    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<Option<i32>, ProgrammerError>;
}

pub type SharedRunner = Arc<Mutex<dyn CommandRunner>>;

/// Run `invocation`, mapping a non-zero exit or a timeout to an error.
pub fn run_tool(runner: &SharedRunner, invocation: &Invocation, timeout: Duration) -> Result<(), ProgrammerError> {
    info!(command = %invocation.line(), "running");
    match lock(runner).run(invocation, timeout)? {
        Some(0) => Ok(()),
        Some(code) => Err(ProgrammerError::Exit {
            tool: invocation.program.clone(),
            code,
        }),
        None => Err(ProgrammerError::Timeout {
            tool: invocation.program.clone(),
            seconds: timeout.as_secs(),
        }),
    }
}

/// Spawns real processes.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn shared() -> SharedRunner {
        Arc::new(Mutex::new(SystemRunner))
    }
}

async fn run_child(invocation: &Invocation, timeout: Duration) -> Result<Option<i32>, ProgrammerError> {
    let mut child = tokio::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(Some(status?.code().unwrap_or(-1))),
        Err(_) => Ok(timed_out(&invocation.program, child.kill().await)),
    }
}

/// A tool that outlived its timeout reports `None` whether or not the kill
/// went through.
fn timed_out(tool: &str, killed: io::Result<()>) -> Option<i32> {
    if let Err(e) = killed {
        warn!(tool, error = %e, "failed to kill timed-out tool");
    }
    None
}

impl CommandRunner for SystemRunner {
    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<Option<i32>, ProgrammerError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(run_child(invocation, timeout))
    }
}

#[derive(Debug, Default)]
struct SimRunnerState {
    invocations: Vec<String>,
    timeouts: Vec<Duration>,
    results: VecDeque<Option<i32>>,
}

/// FIFO-mode runner: records command lines, answers with queued results.
#[derive(Debug, Clone, Default)]
pub struct SimRunner {
    state: Arc<Mutex<SimRunnerState>>,
}

impl SimRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_exit(&self, code: i32) {
        lock(&self.state).results.push_back(Some(code));
    }

    pub fn queue_timeout(&self) {
        lock(&self.state).results.push_back(None);
    }

    pub fn invocations(&self) -> Vec<String> {
        lock(&self.state).invocations.clone()
    }

    /// The timeout each invocation was given.
    pub fn timeouts(&self) -> Vec<Duration> {
        lock(&self.state).timeouts.clone()
    }

    pub fn shared(&self) -> SharedRunner {
        Arc::new(Mutex::new(self.clone()))
    }
}

impl CommandRunner for SimRunner {
    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<Option<i32>, ProgrammerError> {
        let mut state = lock(&self.state);
        state.invocations.push(invocation.line());
        state.timeouts.push(timeout);
        state
            .results
            .pop_front()
            .ok_or_else(|| ProgrammerError::Runner(format!("no result queued for {}", invocation.program)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let exit = ProgrammerError::Exit { tool: "nrfjprog".into(), code: 33 };
        assert_eq!(outcome_text(&Err(exit)), "Error 33");
        let timeout = ProgrammerError::Timeout { tool: "x".into(), seconds: 60 };
        assert_eq!(timeout.code(), -1);
        let verify = ProgrammerError::Verification { address: 0, expected: 1, found: 2 };
        assert_eq!(verify.code(), -2);
        assert_eq!(outcome_text(&Ok(())), "ok");
    }

    #[test]
    fn test_failed_kill_still_reports_timeout() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "operation not permitted");
        assert_eq!(timed_out("nrfjprog", Err(denied)), None);
        assert_eq!(timed_out("nrfjprog", Ok(())), None);
    }

    #[test]
    fn test_invocation_line() {
        let inv = Invocation::new("nrfjprog").arg("-f").arg("NRF52");
        assert_eq!(inv.line(), "nrfjprog -f NRF52");
    }
}
