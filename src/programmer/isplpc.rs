//! In-system programming of LPC-family ARM parts over the UART bootloader.
//!
//! `begin` drives the UUT into ISP mode and hands the port to a worker
//! thread that runs the bootloader dialogue; `wait` joins the worker and
//! takes the port back.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::{ProgrammerBackend, ProgrammerError};
use crate::sensors::instrument::{lock, SharedRelay};
use crate::serial::{self, ByteStream, SerialError};
use crate::timing::SharedClock;

pub const CRYSTAL_KHZ: u32 = 12_000;
pub const UNLOCK_CODE: u32 = 23_130;
pub const BLOCK_SIZE: usize = 1024;
pub const SECTOR_SIZE: usize = 4096;
pub const RAM_BUFFER: u32 = 0x1000_0300;
pub const CRP_OFFSET: usize = 0x2FC;
pub const CRP_ENABLED: u32 = 0x1234_5678;
pub const CRP_DISABLED: u32 = 0xFFFF_FFFF;

const BOOT_PULSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum IspError {
    #[error(transparent)]
    Serial(#[from] SerialError),
    #[error("{command}: ISP return code {code}")]
    Return { command: String, code: u32 },
    #[error("{command}: expected {expected:?}, got {got:?}")]
    Unexpected {
        command: String,
        expected: String,
        got: String,
    },
    #[error("{command}: no reply")]
    Timeout { command: String },
    #[error("image is empty")]
    EmptyImage,
}

/// How the UUT is forced into its bootloader.
#[derive(Clone)]
pub enum BootMethod {
    /// Dedicated BOOT and RESET relays on the fixture.
    Relays { boot: SharedRelay, reset: SharedRelay },
    /// BDA4 adapter: RTS drives BOOT, DTR drives RESET.
    Bda4,
}

impl std::fmt::Debug for BootMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootMethod::Relays { .. } => f.write_str("Relays"),
            BootMethod::Bda4 => f.write_str("Bda4"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IspOptions {
    pub erase_only: bool,
    pub verify: bool,
    /// `Some(true)` sets code read protection, `Some(false)` clears it.
    pub crp: Option<bool>,
}

/// Pad to whole blocks, fix the vector checksum, apply the CRP word.
pub fn prepare_image(raw: &[u8], crp: Option<bool>) -> Result<Vec<u8>, IspError> {
    if raw.is_empty() {
        return Err(IspError::EmptyImage);
    }
    let mut image = raw.to_vec();
    let padded = image.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    image.resize(padded, 0xFF);

    // Word 7 makes the first eight vector words sum to zero.
    let sum = (0..7).fold(0u32, |acc, i| acc.wrapping_add(read_word(&image, i * 4)));
    write_word(&mut image, 7 * 4, 0u32.wrapping_sub(sum));

    if let Some(enabled) = crp {
        let word = if enabled { CRP_ENABLED } else { CRP_DISABLED };
        write_word(&mut image, CRP_OFFSET, word);
    }
    Ok(image)
}

fn read_word(image: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&image[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn write_word(image: &mut [u8], offset: usize, word: u32) {
    image[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
}

/// The bootloader dialogue over one port.
pub struct IspSession<'a> {
    port: &'a mut dyn ByteStream,
}

impl<'a> IspSession<'a> {
    pub fn new(port: &'a mut dyn ByteStream) -> Self {
        Self { port }
    }

    fn line(&mut self, command: &str) -> Result<String, IspError> {
        match serial::read_line(&mut *self.port) {
            Ok(line) => Ok(line.trim().to_string()),
            Err(SerialError::Timeout { .. }) => Err(IspError::Timeout {
                command: command.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn expect(&mut self, command: &str, expected: &str) -> Result<(), IspError> {
        let got = self.line(command)?;
        if got != expected {
            return Err(IspError::Unexpected {
                command: command.to_string(),
                expected: expected.to_string(),
                got,
            });
        }
        Ok(())
    }

    fn return_code(&mut self, command: &str) -> Result<(), IspError> {
        let got = self.line(command)?;
        match got.parse::<u32>() {
            Ok(0) => Ok(()),
            Ok(code) => Err(IspError::Return {
                command: command.to_string(),
                code,
            }),
            Err(_) => Err(IspError::Unexpected {
                command: command.to_string(),
                expected: "return code".to_string(),
                got,
            }),
        }
    }

    fn send(&mut self, command: &str) -> Result<(), IspError> {
        debug!(command, "isp");
        self.port.write(format!("{}\r\n", command).as_bytes())?;
        Ok(())
    }

    /// Send a command and check its return code.
    fn command(&mut self, command: &str) -> Result<(), IspError> {
        self.send(command)?;
        self.return_code(command)
    }

    pub fn synchronize(&mut self) -> Result<String, IspError> {
        self.port.write(b"?")?;
        self.expect("?", "Synchronized")?;
        self.send("Synchronized")?;
        self.expect("Synchronized", "Synchronized")?;
        self.expect("Synchronized", "OK")?;

        let crystal = CRYSTAL_KHZ.to_string();
        self.send(&crystal)?;
        self.expect(&crystal, &crystal)?;
        self.expect(&crystal, "OK")?;

        // Echo is still on for this one.
        self.send("A 0")?;
        self.expect("A 0", "A 0")?;
        self.return_code("A 0")?;

        self.command(&format!("U {}", UNLOCK_CODE))?;
        self.command("J")?;
        let part_id = self.line("J")?;
        info!(part_id = %part_id, "bootloader synchronized");
        Ok(part_id)
    }

    pub fn erase(&mut self, last_sector: usize) -> Result<(), IspError> {
        self.command(&format!("P 0 {}", last_sector))?;
        self.command(&format!("E 0 {}", last_sector))
    }

    pub fn program(&mut self, raw: &[u8], options: IspOptions) -> Result<(), IspError> {
        let image = prepare_image(raw, options.crp)?;
        let last_sector = (image.len() - 1) / SECTOR_SIZE;

        self.synchronize()?;
        self.erase(last_sector)?;
        if options.erase_only {
            info!(sectors = last_sector + 1, "erase only");
            return Ok(());
        }

        for (index, block) in image.chunks(BLOCK_SIZE).enumerate() {
            let flash = index * BLOCK_SIZE;
            let sector = flash / SECTOR_SIZE;
            self.command(&format!("W {} {}", RAM_BUFFER, block.len()))?;
            self.port.write(block)?;
            self.command(&format!("P {} {}", sector, sector))?;
            self.command(&format!("C {} {} {}", flash, RAM_BUFFER, block.len()))?;
            if options.verify {
                self.command(&format!("M {} {} {}", flash, RAM_BUFFER, block.len()))?;
            }
        }
        info!(bytes = image.len(), verify = options.verify, "image written");
        Ok(())
    }
}

type WorkerOutput = (Box<dyn ByteStream>, Result<(), IspError>);

pub struct IspLpcBackend {
    port: Option<Box<dyn ByteStream>>,
    image: PathBuf,
    boot: BootMethod,
    options: IspOptions,
    clock: SharedClock,
    worker: Option<JoinHandle<WorkerOutput>>,
}

impl IspLpcBackend {
    pub fn new(port: Box<dyn ByteStream>, image: &Path, boot: BootMethod, options: IspOptions, clock: SharedClock) -> Self {
        Self {
            port: Some(port),
            image: image.to_path_buf(),
            boot,
            options,
            clock,
            worker: None,
        }
    }

    fn enter_isp(&self, port: &mut dyn ByteStream) -> Result<(), ProgrammerError> {
        match &self.boot {
            BootMethod::Relays { boot, reset } => {
                lock(boot).set(true)?;
                self.clock.sleep(BOOT_PULSE);
                lock(reset).set(true)?;
                self.clock.sleep(BOOT_PULSE);
                lock(reset).set(false)?;
                self.clock.sleep(BOOT_PULSE);
                lock(boot).set(false)?;
            }
            BootMethod::Bda4 => {
                port.set_rts(true)?;
                port.set_dtr(true)?;
                self.clock.sleep(BOOT_PULSE);
                port.set_dtr(false)?;
                self.clock.sleep(BOOT_PULSE);
                port.set_rts(false)?;
            }
        }
        debug!(boot = ?self.boot, "ISP mode entered");
        Ok(())
    }

    fn prepare(&self, port: &mut dyn ByteStream) -> Result<Vec<u8>, ProgrammerError> {
        let image = fs::read(&self.image)?;
        port.open()?;
        self.enter_isp(port)?;
        Ok(image)
    }
}

impl ProgrammerBackend for IspLpcBackend {
    fn name(&self) -> &str {
        "isplpc"
    }

    fn begin(&mut self) -> Result<(), ProgrammerError> {
        let mut port = self.port.take().ok_or(ProgrammerError::NotStarted)?;
        let image = match self.prepare(port.as_mut()) {
            Ok(image) => image,
            Err(e) => {
                self.port = Some(port);
                return Err(e);
            }
        };
        let options = self.options;
        self.worker = Some(thread::spawn(move || {
            let result = IspSession::new(port.as_mut()).program(&image, options);
            (port, result)
        }));
        Ok(())
    }

    fn wait(&mut self) -> Result<(), ProgrammerError> {
        let worker = self.worker.take().ok_or(ProgrammerError::NotStarted)?;
        let (mut port, result) = worker.join().map_err(|_| ProgrammerError::Worker)?;
        let closed = port.close();
        self.port = Some(port);
        result?;
        closed?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_checksum() {
        let mut raw = vec![0u8; 64];
        raw[0..4].copy_from_slice(&0x1000_1000u32.to_le_bytes());
        raw[4..8].copy_from_slice(&0x0000_00C1u32.to_le_bytes());
        let image = prepare_image(&raw, None).unwrap();
        assert_eq!(image.len(), BLOCK_SIZE);
        let sum = (0..8).fold(0u32, |acc, i| acc.wrapping_add(read_word(&image, i * 4)));
        assert_eq!(sum, 0);
        assert_eq!(image[100], 0xFF);
    }

    #[test]
    fn test_crp_word() {
        let image = prepare_image(&[0u8; 32], Some(true)).unwrap();
        assert_eq!(read_word(&image, CRP_OFFSET), CRP_ENABLED);
        let image = prepare_image(&[0u8; 32], Some(false)).unwrap();
        assert_eq!(read_word(&image, CRP_OFFSET), CRP_DISABLED);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(prepare_image(&[], None), Err(IspError::EmptyImage)));
    }
}
