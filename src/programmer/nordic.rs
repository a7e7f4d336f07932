use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use super::{run_tool, Invocation, ProgrammerBackend, ProgrammerError, SharedRunner, DEFAULT_PROGRAMMER_TIMEOUT};

pub const NRFJPROG: &str = "nrfjprog";

/// Nordic nRF52 through the vendor `nrfjprog` utility.
pub struct NordicBackend {
    runner: SharedRunner,
    image: PathBuf,
    serial: Option<String>,
    force_code: Option<(u32, u32)>,
    timeout: Duration,
    pending: Vec<Invocation>,
}

impl NordicBackend {
    pub fn new(runner: SharedRunner, image: &Path) -> Self {
        Self {
            runner,
            image: image.to_path_buf(),
            serial: None,
            force_code: None,
            timeout: DEFAULT_PROGRAMMER_TIMEOUT,
            pending: Vec::new(),
        }
    }

    /// Only program the J-Link with this serial number.
    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    /// Write `value` to `address` after flashing.
    pub fn force_code(mut self, address: u32, value: u32) -> Self {
        self.force_code = Some((address, value));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn base(&self) -> Invocation {
        Invocation::new(NRFJPROG).arg("-f").arg("NRF52")
    }

    fn with_serial(&self, invocation: Invocation) -> Invocation {
        match &self.serial {
            Some(serial) => invocation.arg("-s").arg(serial.as_str()),
            None => invocation,
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        let program = self
            .base()
            .arg("--chiperase")
            .arg("--program")
            .arg(self.image.display().to_string())
            .arg("--verify");
        let mut invocations = vec![self.with_serial(program)];
        if let Some((address, value)) = self.force_code {
            let write = self
                .base()
                .arg("--memwr")
                .arg(format!("0x{:08X}", address))
                .arg("--val")
                .arg(value.to_string());
            invocations.push(self.with_serial(write));
        }
        invocations
    }
}

impl ProgrammerBackend for NordicBackend {
    fn name(&self) -> &str {
        NRFJPROG
    }

    fn begin(&mut self) -> Result<(), ProgrammerError> {
        std::fs::metadata(&self.image)?;
        self.pending = self.invocations();
        Ok(())
    }

    fn wait(&mut self) -> Result<(), ProgrammerError> {
        for invocation in std::mem::take(&mut self.pending) {
            run_tool(&self.runner, &invocation, self.timeout)?;
        }
        info!(image = %self.image.display(), "nRF52 programmed");
        Ok(())
    }
}
