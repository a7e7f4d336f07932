//! Thin wrappers over vendor programming CLIs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use super::{run_tool, Invocation, ProgrammerBackend, ProgrammerError, SharedRunner, DEFAULT_PROGRAMMER_TIMEOUT};

pub const PICPROGRAMMER: &str = "picprogrammer";
pub const JLINK: &str = "JLinkExe";

pub struct PicBackend {
    runner: SharedRunner,
    device: String,
    image: PathBuf,
    timeout: Duration,
    pending: Option<Invocation>,
}

impl PicBackend {
    pub fn new(runner: SharedRunner, device: &str, image: &Path) -> Self {
        Self {
            runner,
            device: device.to_string(),
            image: image.to_path_buf(),
            timeout: DEFAULT_PROGRAMMER_TIMEOUT,
            pending: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invocation(&self) -> Invocation {
        Invocation::new(PICPROGRAMMER)
            .arg("--device")
            .arg(self.device.as_str())
            .arg("--erase")
            .arg("--program")
            .arg(self.image.display().to_string())
            .arg("--verify")
    }
}

impl ProgrammerBackend for PicBackend {
    fn name(&self) -> &str {
        PICPROGRAMMER
    }

    fn begin(&mut self) -> Result<(), ProgrammerError> {
        std::fs::metadata(&self.image)?;
        self.pending = Some(self.invocation());
        Ok(())
    }

    /// A timed-out run is repeated once; the programmer erases first, so
    /// the second attempt starts from a clean part.
    fn wait(&mut self) -> Result<(), ProgrammerError> {
        let invocation = self.pending.take().ok_or(ProgrammerError::NotStarted)?;
        match run_tool(&self.runner, &invocation, self.timeout) {
            Err(ProgrammerError::Timeout { .. }) => {
                warn!(device = %self.device, "picprogrammer timed out, retrying once");
                run_tool(&self.runner, &invocation, self.timeout)
            }
            other => other,
        }
    }
}

/// SEGGER J-Link Commander running a command script.
pub struct JLinkBackend {
    runner: SharedRunner,
    device: String,
    script: PathBuf,
    speed_khz: u32,
    timeout: Duration,
    pending: Option<Invocation>,
}

impl JLinkBackend {
    pub fn new(runner: SharedRunner, device: &str, script: &Path) -> Self {
        Self {
            runner,
            device: device.to_string(),
            script: script.to_path_buf(),
            speed_khz: 4000,
            timeout: DEFAULT_PROGRAMMER_TIMEOUT,
            pending: None,
        }
    }

    pub fn speed(mut self, khz: u32) -> Self {
        self.speed_khz = khz;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invocation(&self) -> Invocation {
        Invocation::new(JLINK)
            .arg("-device")
            .arg(self.device.as_str())
            .arg("-if")
            .arg("SWD")
            .arg("-speed")
            .arg(self.speed_khz.to_string())
            .arg("-autoconnect")
            .arg("1")
            .arg("-ExitOnError")
            .arg("1")
            .arg("-CommanderScript")
            .arg(self.script.display().to_string())
    }
}

impl ProgrammerBackend for JLinkBackend {
    fn name(&self) -> &str {
        JLINK
    }

    fn begin(&mut self) -> Result<(), ProgrammerError> {
        std::fs::metadata(&self.script)?;
        self.pending = Some(self.invocation());
        Ok(())
    }

    fn wait(&mut self) -> Result<(), ProgrammerError> {
        let invocation = self.pending.take().ok_or(ProgrammerError::NotStarted)?;
        run_tool(&self.runner, &invocation, self.timeout)
    }
}
