//! AVR parts over the UPDI one-wire interface.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::ihex::HexImage;
use super::{ProgrammerBackend, ProgrammerError};
use crate::sensors::instrument::lock;

#[derive(Debug, Error)]
pub enum UpdiError {
    #[error("device is locked")]
    Locked,
    #[error("not in programming mode")]
    NotInProgMode,
    #[error("UPDI link: {0}")]
    Link(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub family: String,
    pub nvm_version: u8,
    pub signature: [u8; 3],
}

/// The physical UPDI link.
pub trait UpdiLink: Send {
    fn is_locked(&mut self) -> Result<bool, UpdiError>;
    /// Chip-erase with the unlock key; clears the lock bits.
    fn unlock(&mut self) -> Result<(), UpdiError>;
    fn enter_progmode(&mut self) -> Result<(), UpdiError>;
    fn leave_progmode(&mut self) -> Result<(), UpdiError>;
    fn device_info(&mut self) -> Result<DeviceInfo, UpdiError>;
    fn chip_erase(&mut self) -> Result<(), UpdiError>;
    fn write_flash(&mut self, address: u32, data: &[u8]) -> Result<(), UpdiError>;
    fn read_flash(&mut self, address: u32, len: usize) -> Result<Vec<u8>, UpdiError>;
    fn write_fuse(&mut self, fuse: u8, value: u8) -> Result<(), UpdiError>;
}

#[derive(Debug)]
struct SimUpdiState {
    locked: bool,
    progmode: bool,
    flash: BTreeMap<u32, u8>,
    fuses: BTreeMap<u8, u8>,
    stuck_bit: Option<u32>,
    info: DeviceInfo,
    log: Vec<String>,
}

/// In-memory UPDI target for FIFO runs.
#[derive(Debug, Clone)]
pub struct SimUpdi {
    state: Arc<Mutex<SimUpdiState>>,
}

impl SimUpdi {
    pub fn new(family: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimUpdiState {
                locked: false,
                progmode: false,
                flash: BTreeMap::new(),
                fuses: BTreeMap::new(),
                stuck_bit: None,
                info: DeviceInfo {
                    family: family.to_string(),
                    nvm_version: 0,
                    signature: [0x1E, 0x94, 0x20],
                },
                log: Vec::new(),
            })),
        }
    }

    pub fn set_locked(&self, locked: bool) {
        lock(&self.state).locked = locked;
    }

    /// Flash at `address` keeps bit 0 set regardless of what is written.
    pub fn set_stuck_bit(&self, address: u32) {
        lock(&self.state).stuck_bit = Some(address);
    }

    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        let state = lock(&self.state);
        (0..len as u32)
            .map(|i| state.flash.get(&(address + i)).copied().unwrap_or(0xFF))
            .collect()
    }

    pub fn fuse(&self, fuse: u8) -> Option<u8> {
        lock(&self.state).fuses.get(&fuse).copied()
    }

    pub fn log(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    fn record(&self, entry: &str) {
        lock(&self.state).log.push(entry.to_string());
    }

    fn require_progmode(&self) -> Result<(), UpdiError> {
        if lock(&self.state).progmode {
            Ok(())
        } else {
            Err(UpdiError::NotInProgMode)
        }
    }
}

impl UpdiLink for SimUpdi {
    fn is_locked(&mut self) -> Result<bool, UpdiError> {
        Ok(lock(&self.state).locked)
    }

    fn unlock(&mut self) -> Result<(), UpdiError> {
        self.record("unlock");
        let mut state = lock(&self.state);
        state.locked = false;
        state.flash.clear();
        Ok(())
    }

    fn enter_progmode(&mut self) -> Result<(), UpdiError> {
        self.record("enter");
        let mut state = lock(&self.state);
        if state.locked {
            return Err(UpdiError::Locked);
        }
        state.progmode = true;
        Ok(())
    }

    fn leave_progmode(&mut self) -> Result<(), UpdiError> {
        self.record("leave");
        lock(&self.state).progmode = false;
        Ok(())
    }

    fn device_info(&mut self) -> Result<DeviceInfo, UpdiError> {
        Ok(lock(&self.state).info.clone())
    }

    fn chip_erase(&mut self) -> Result<(), UpdiError> {
        self.require_progmode()?;
        self.record("erase");
        lock(&self.state).flash.clear();
        Ok(())
    }

    fn write_flash(&mut self, address: u32, data: &[u8]) -> Result<(), UpdiError> {
        self.require_progmode()?;
        self.record(&format!("write {:#06x} {}", address, data.len()));
        let mut state = lock(&self.state);
        let stuck = state.stuck_bit;
        for (i, &byte) in data.iter().enumerate() {
            let at = address + i as u32;
            let value = if stuck == Some(at) { byte | 0x01 } else { byte };
            state.flash.insert(at, value);
        }
        Ok(())
    }

    fn read_flash(&mut self, address: u32, len: usize) -> Result<Vec<u8>, UpdiError> {
        self.require_progmode()?;
        Ok(self.flash(address, len))
    }

    fn write_fuse(&mut self, fuse: u8, value: u8) -> Result<(), UpdiError> {
        self.require_progmode()?;
        self.record(&format!("fuse {} {:#04x}", fuse, value));
        lock(&self.state).fuses.insert(fuse, value);
        Ok(())
    }
}

pub struct AvrBackend {
    link: Box<dyn UpdiLink>,
    hex: PathBuf,
    fuses: Vec<(u8, u8)>,
    outcome: Option<Result<(), ProgrammerError>>,
}

impl AvrBackend {
    pub fn new(link: Box<dyn UpdiLink>, hex: &Path) -> Self {
        Self {
            link,
            hex: hex.to_path_buf(),
            fuses: Vec::new(),
            outcome: None,
        }
    }

    /// Per-device fuse map, written after a verified flash.
    pub fn fuses(mut self, fuses: &[(u8, u8)]) -> Self {
        self.fuses = fuses.to_vec();
        self
    }

    fn enter(&mut self) -> Result<(), ProgrammerError> {
        if self.link.is_locked()? {
            info!("device locked, unlocking");
            self.link.unlock()?;
        }
        self.link.enter_progmode()?;
        Ok(())
    }

    fn flash(&mut self) -> Result<(), ProgrammerError> {
        let info = self.link.device_info()?;
        debug!(family = %info.family, signature = ?info.signature, "device info");

        let image = HexImage::parse(&fs::read_to_string(&self.hex)?)?;
        self.link.chip_erase()?;
        for segment in &image.segments {
            self.link.write_flash(segment.address, &segment.data)?;
        }
        for segment in &image.segments {
            let readback = self.link.read_flash(segment.address, segment.data.len())?;
            let mismatch = segment.data.iter().zip(&readback).position(|(a, b)| a != b);
            if let Some(i) = mismatch {
                return Err(ProgrammerError::Verification {
                    address: segment.address + i as u32,
                    expected: segment.data[i],
                    found: readback[i],
                });
            }
        }
        for &(fuse, value) in &self.fuses {
            self.link.write_fuse(fuse, value)?;
        }
        info!(bytes = image.len(), family = %info.family, "AVR programmed");
        Ok(())
    }

    fn run(&mut self) -> Result<(), ProgrammerError> {
        self.enter()?;
        let result = self.flash();
        let left = self.link.leave_progmode();
        if let Err(e) = &left {
            warn!(error = %e, "failed to leave programming mode");
        }
        result?;
        left?;
        Ok(())
    }
}

impl ProgrammerBackend for AvrBackend {
    fn name(&self) -> &str {
        "updi"
    }

    fn begin(&mut self) -> Result<(), ProgrammerError> {
        let outcome = self.run();
        self.outcome = Some(outcome);
        Ok(())
    }

    fn wait(&mut self) -> Result<(), ProgrammerError> {
        self.outcome.take().unwrap_or(Err(ProgrammerError::NotStarted))
    }
}
