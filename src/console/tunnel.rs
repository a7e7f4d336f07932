//! Console traffic carried in CAN frames through a gateway console.
//!
//! [`CanTunnel`] is a [`ByteStream`], so a console stacked on it cannot tell
//! it apart from a UART. Outgoing bytes become `TCC` frames on the gateway;
//! incoming `RRC` frames addressed from the target are unpacked into an
//! internal buffer that `read` serves.

use std::sync::MutexGuard;
use std::time::Duration;

use arrayvec::ArrayVec;
use tracing::{debug, trace};

use super::{Console, SharedConsole};
use crate::sensors::instrument::lock;
use crate::serial::{ByteStream, SerialError, SimSerial};

pub const MAX_FRAME_PAYLOAD: usize = 8;

/// Payload bytes of one `RRC,<id>,4,<n>,<b0>,...` frame from `target`.
pub fn parse_rrc(line: &str, target: u16) -> Option<Vec<u8>> {
    let start = line.find("RRC,")?;
    let mut fields = line[start + 4..].trim().split(',').map(str::trim);
    let id: u16 = fields.next()?.parse().ok()?;
    if id != target || fields.next()? != "4" {
        return None;
    }
    let count: usize = fields.next()?.parse().ok()?;
    let payload: Vec<u8> = fields.take(count).map(str::parse).collect::<Result<_, _>>().ok()?;
    if payload.len() != count {
        return None;
    }
    Some(payload)
}

pub struct CanTunnel {
    name: String,
    gateway: SharedConsole,
    target: u16,
    local: u16,
    inbox: SimSerial,
    open: bool,
}

impl CanTunnel {
    pub fn new(gateway: SharedConsole, target: u16, local: u16) -> Self {
        let name = format!("can-tunnel-{}", target);
        Self {
            inbox: SimSerial::new(&name),
            name,
            gateway,
            target,
            local,
            open: false,
        }
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    pub fn local(&self) -> u16 {
        self.local
    }

    fn gateway(&self) -> MutexGuard<'_, Console> {
        lock(&self.gateway)
    }

    fn gateway_action(&self, command: &str) -> Result<(), SerialError> {
        self.gateway()
            .action(command, Duration::ZERO, 0)
            .map(|_| ())
            .map_err(|e| SerialError::Tunnel(e.to_string()))
    }

    fn send_frame(&self, payload: &ArrayVec<u8, MAX_FRAME_PAYLOAD>) -> Result<(), SerialError> {
        let bytes: Vec<String> = payload.iter().map(u8::to_string).collect();
        let command = format!("\"TCC,{},4,{},{} CAN", self.target, payload.len(), bytes.join(","));
        trace!(tunnel = %self.name, %command, "frame out");
        self.gateway_action(&command)
    }

    /// Drain gateway lines until it goes quiet, keeping frames from the target.
    fn poll(&mut self) -> Result<(), SerialError> {
        loop {
            let line = self
                .gateway()
                .read_line()
                .map_err(|e| SerialError::Tunnel(e.to_string()))?;
            let Some(line) = line else {
                return Ok(());
            };
            if let Some(payload) = parse_rrc(&line, self.target) {
                trace!(tunnel = %self.name, ?payload, "frame in");
                self.inbox.puts(&payload, 0, 0, false);
            }
        }
    }
}

impl ByteStream for CanTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), SerialError> {
        {
            let mut gateway = self.gateway();
            gateway.open().map_err(|e| SerialError::Tunnel(e.to_string()))?;
        }
        self.gateway_action("\"RF,ALL CAN")?;
        self.gateway_action(&format!("\"TCC,{},3,{},1 CAN", self.target, self.local))?;
        self.inbox.open()?;
        self.open = true;
        debug!(tunnel = %self.name, local = self.local, "tunnel opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), SerialError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.inbox.close()?;
        self.gateway_action(&format!("\"TCC,{},3,{},0 CAN", self.target, self.local))?;
        debug!(tunnel = %self.name, "tunnel closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, SerialError> {
        if !self.open {
            return Err(SerialError::NotOpen(self.name.clone()));
        }
        if self.inbox.in_waiting()? < n {
            self.poll()?;
        }
        self.inbox.read(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        if !self.open {
            return Err(SerialError::NotOpen(self.name.clone()));
        }
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let payload = ArrayVec::try_from(chunk).map_err(|e| SerialError::Tunnel(e.to_string()))?;
            self.send_frame(&payload)?;
        }
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), SerialError> {
        self.inbox.flush_input()
    }

    fn in_waiting(&mut self) -> Result<usize, SerialError> {
        self.inbox.in_waiting()
    }
}

impl std::fmt::Debug for CanTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanTunnel")
            .field("target", &self.target)
            .field("local", &self.local)
            .field("open", &self.open)
            .finish()
    }
}
