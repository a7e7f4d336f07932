//! The narrow instrument interface the core consumes, and the sensor that
//! reads through it.
//!
//! Physical drivers (DMM, sources, loads, relay drivers) live outside this
//! crate and implement [`Instrument`], [`Stimulus`] or [`Relay`]. The
//! simulated counterparts serve FIFO runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{ReadingValue, Sensor, SensorError};

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("{instrument}: no {quantity} reading queued on channel {channel}")]
    NoData {
        instrument: String,
        quantity: Quantity,
        channel: u16,
    },
    #[error("{instrument}: hardware fault: {detail}")]
    Hardware { instrument: String, detail: String },
    #[error("{0}: operation complete not signalled")]
    OperationComplete(String),
    #[error("no device named {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    Voltage,
    Current,
    Resistance,
    Frequency,
    Period,
    Temperature,
    Capacitance,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Resistance => "resistance",
            Quantity::Frequency => "frequency",
            Quantity::Period => "period",
            Quantity::Temperature => "temperature",
            Quantity::Capacitance => "capacitance",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub quantity: Quantity,
    pub channel: u16,
    pub range: Option<f64>,
    pub resolution: Option<f64>,
    pub nplc: Option<f64>,
    pub scale: f64,
}

impl ChannelConfig {
    pub fn new(quantity: Quantity, channel: u16) -> Self {
        Self {
            quantity,
            channel,
            range: None,
            resolution: None,
            nplc: None,
            scale: 1.0,
        }
    }

    pub fn range(mut self, range: f64) -> Self {
        self.range = Some(range);
        self
    }

    pub fn resolution(mut self, resolution: f64) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn nplc(mut self, nplc: f64) -> Self {
        self.nplc = Some(nplc);
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }
}

/// A measuring instrument channel.
pub trait Instrument: Send {
    fn name(&self) -> &str;
    fn configure(&mut self, config: &ChannelConfig) -> Result<(), InstrumentError>;
    fn measure(&mut self, config: &ChannelConfig) -> Result<f64, InstrumentError>;
}

/// A source or load that can be driven to a level.
pub trait Stimulus: Send {
    fn name(&self) -> &str;
    fn output(&mut self, value: f64) -> Result<(), InstrumentError>;
    /// The level most recently set.
    fn level(&self) -> f64;
    /// Block until the previous command has completed.
    fn opc(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }
}

pub trait Relay: Send {
    fn name(&self) -> &str;
    fn set(&mut self, on: bool) -> Result<(), InstrumentError>;
    fn is_on(&self) -> bool;
}

pub type SharedInstrument = Arc<Mutex<dyn Instrument>>;
pub type SharedStimulus = Arc<Mutex<dyn Stimulus>>;
pub type SharedRelay = Arc<Mutex<dyn Relay>>;

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads one quantity from an instrument channel.
pub struct InstrumentSensor {
    name: String,
    instrument: SharedInstrument,
    config: ChannelConfig,
    position: usize,
}

impl InstrumentSensor {
    pub fn new(name: &str, instrument: SharedInstrument, config: ChannelConfig) -> Self {
        Self {
            name: name.to_string(),
            instrument,
            config,
            position: 1,
        }
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }
}

impl Sensor for InstrumentSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        lock(&self.instrument).configure(&self.config)?;
        Ok(())
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        let raw = lock(&self.instrument).measure(&self.config)?;
        Ok(ReadingValue::Number(raw * self.config.scale))
    }

    fn position(&self) -> usize {
        self.position
    }
}

#[derive(Debug, Default)]
struct SimInstrumentState {
    readings: HashMap<(Quantity, u16), VecDeque<f64>>,
    configured: Vec<ChannelConfig>,
    outputs: Vec<f64>,
    level: f64,
}

/// FIFO-mode instrument: serves staged readings and records outputs.
#[derive(Debug, Clone)]
pub struct SimInstrument {
    name: String,
    state: Arc<Mutex<SimInstrumentState>>,
}

impl SimInstrument {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(SimInstrumentState::default())),
        }
    }

    pub fn stage(&self, quantity: Quantity, channel: u16, values: &[f64]) {
        lock(&self.state)
            .readings
            .entry((quantity, channel))
            .or_default()
            .extend(values.iter().copied());
    }

    pub fn outputs(&self) -> Vec<f64> {
        lock(&self.state).outputs.clone()
    }

    pub fn configured(&self) -> Vec<ChannelConfig> {
        lock(&self.state).configured.clone()
    }

    pub fn remaining(&self, quantity: Quantity, channel: u16) -> usize {
        lock(&self.state)
            .readings
            .get(&(quantity, channel))
            .map_or(0, VecDeque::len)
    }

    pub fn shared(&self) -> SharedInstrument {
        Arc::new(Mutex::new(self.clone()))
    }

    pub fn shared_stimulus(&self) -> SharedStimulus {
        Arc::new(Mutex::new(self.clone()))
    }
}

impl Instrument for SimInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, config: &ChannelConfig) -> Result<(), InstrumentError> {
        lock(&self.state).configured.push(config.clone());
        Ok(())
    }

    fn measure(&mut self, config: &ChannelConfig) -> Result<f64, InstrumentError> {
        lock(&self.state)
            .readings
            .get_mut(&(config.quantity, config.channel))
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| InstrumentError::NoData {
                instrument: self.name.clone(),
                quantity: config.quantity,
                channel: config.channel,
            })
    }
}

impl Stimulus for SimInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn output(&mut self, value: f64) -> Result<(), InstrumentError> {
        debug!(instrument = %self.name, value, "output");
        let mut state = lock(&self.state);
        state.outputs.push(value);
        state.level = value;
        Ok(())
    }

    fn level(&self) -> f64 {
        lock(&self.state).level
    }
}

/// FIFO-mode relay that remembers every transition.
#[derive(Debug, Clone)]
pub struct SimRelay {
    name: String,
    history: Arc<Mutex<Vec<bool>>>,
}

impl SimRelay {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn history(&self) -> Vec<bool> {
        lock(&self.history).clone()
    }

    pub fn shared(&self) -> SharedRelay {
        Arc::new(Mutex::new(self.clone()))
    }
}

impl Relay for SimRelay {
    fn name(&self) -> &str {
        &self.name
    }

    fn set(&mut self, on: bool) -> Result<(), InstrumentError> {
        lock(&self.history).push(on);
        Ok(())
    }

    fn is_on(&self) -> bool {
        lock(&self.history).last().copied().unwrap_or(false)
    }
}
