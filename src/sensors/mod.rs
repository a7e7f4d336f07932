pub mod instrument;
pub mod console;
pub mod mirror;
pub mod ramp;
pub mod operator;

pub use instrument::{
    ChannelConfig, Instrument, InstrumentError, InstrumentSensor, Quantity, Relay, SharedInstrument,
    SharedRelay, SharedStimulus, SimInstrument, SimRelay, Stimulus,
};
pub use console::ConsoleSensor;
pub use mirror::MirrorSensor;
pub use ramp::RampSensor;
pub use operator::{AdjustAnalogSensor, DataEntrySensor, Operator, SharedOperator, SimOperator, YesNoSensor};

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::console::ConsoleError;

/// A typed value produced by exactly one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadingValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl ReadingValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ReadingValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ReadingValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ReadingValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Number(v) => write!(f, "{}", v),
            ReadingValue::Text(s) => write!(f, "{}", s),
            ReadingValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<f64> for ReadingValue {
    fn from(v: f64) -> Self {
        ReadingValue::Number(v)
    }
}

impl From<bool> for ReadingValue {
    fn from(b: bool) -> Self {
        ReadingValue::Bool(b)
    }
}

impl From<&str> for ReadingValue {
    fn from(s: &str) -> Self {
        ReadingValue::Text(s.to_string())
    }
}

impl From<String> for ReadingValue {
    fn from(s: String) -> Self {
        ReadingValue::Text(s)
    }
}

/// A reading stamped with the panel position it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: ReadingValue,
    pub position: usize,
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{sensor}: {source}")]
    Console {
        sensor: String,
        #[source]
        source: ConsoleError,
        fail_on_error: bool,
    },
    #[error(transparent)]
    Instrument(#[from] InstrumentError),
    #[error("{0}: no value available")]
    Empty(String),
    #[error("{0}: cancelled by operator")]
    Cancelled(String),
}

impl SensorError {
    /// Whether the measurement should record a FAIL result instead of
    /// propagating the error out of the step.
    pub fn is_measurement_failure(&self) -> bool {
        match self {
            SensorError::Console { source, fail_on_error, .. } => *fail_on_error && source.is_protocol_error(),
            SensorError::Empty(_) => true,
            SensorError::Instrument(_) | SensorError::Cancelled(_) => false,
        }
    }
}

/// A source of readings.
///
/// A sensor is configured once per measurement call, then read until the
/// measurement is satisfied or gives up.
pub trait Sensor: Send {
    fn name(&self) -> &str;

    fn configure(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError>;

    fn position(&self) -> usize {
        1
    }

    /// Drop values queued for a run that has ended.
    fn reset_transients(&mut self) {}

    /// Mirror, dialog and ramp sensors are read once, never polled.
    fn single_shot(&self) -> bool {
        false
    }
}

pub type SharedSensor = Arc<Mutex<dyn Sensor>>;

pub fn shared<S: Sensor + 'static>(sensor: S) -> SharedSensor {
    Arc::new(Mutex::new(sensor))
}
