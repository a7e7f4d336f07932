use crate::console::{ConsoleError, ParamValue, SharedConsole};

use super::instrument::lock;
use super::{ReadingValue, Sensor, SensorError};

/// Reads one parameter from a console, typed by the parameter table.
pub struct ConsoleSensor {
    name: String,
    console: SharedConsole,
    key: String,
    position: usize,
}

impl ConsoleSensor {
    pub fn new(name: &str, console: SharedConsole, key: &str) -> Self {
        Self {
            name: name.to_string(),
            console,
            key: key.to_string(),
            position: 1,
        }
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    fn wrap(&self, source: ConsoleError, fail_on_error: bool) -> SensorError {
        SensorError::Console {
            sensor: self.name.clone(),
            source,
            fail_on_error,
        }
    }
}

impl Sensor for ConsoleSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        let console = lock(&self.console);
        if console.params().contains(&self.key) {
            Ok(())
        } else {
            let fail_on_error = console.measurement_fail_on_error();
            drop(console);
            Err(self.wrap(ConsoleError::UnknownParameter(self.key.clone()), fail_on_error))
        }
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        let mut console = lock(&self.console);
        let fail_on_error = console.measurement_fail_on_error();
        let value = console.get(&self.key);
        drop(console);
        match value {
            Ok(ParamValue::Str(s)) => Ok(ReadingValue::Text(s)),
            Ok(ParamValue::Bool(b)) => Ok(ReadingValue::Bool(b)),
            Ok(ParamValue::Float(v)) => Ok(ReadingValue::Number(v)),
            Ok(ParamValue::Hex(v)) => Ok(ReadingValue::Number(f64::from(v))),
            Ok(ParamValue::Override(state)) => Ok(ReadingValue::Number(f64::from(state as u8))),
            Err(e) => Err(self.wrap(e, fail_on_error)),
        }
    }

    fn position(&self) -> usize {
        self.position
    }
}
