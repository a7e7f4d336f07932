use std::time::Duration;

use tracing::{debug, warn};

use super::instrument::{lock, SharedStimulus};
use super::{ReadingValue, Sensor, SensorError};
use crate::limits::SharedLimit;
use crate::timing::SharedClock;

/// Values from `start` towards `stop` in increments of `step`, both ends
/// included when `stop` lies on the grid. Computed by index so rounding
/// does not accumulate.
pub fn stepped_sequence(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step == 0.0 || (stop - start) * step < 0.0 {
        return vec![start];
    }
    let count = ((stop - start) / step + 1e-9).floor() as usize;
    (0..=count).map(|i| start + step * i as f64).collect()
}

/// Drives a stimulus through a ramp while watching another sensor, and
/// reads as the stimulus level at which the detect limit first passed.
///
/// Without a detection the ramp reads as `stop`; the measurement's own
/// limit decides what that means.
pub struct RampSensor {
    name: String,
    stimulus: SharedStimulus,
    sensor: Box<dyn Sensor>,
    detect: SharedLimit,
    start: f64,
    stop: f64,
    step: f64,
    delay: Duration,
    reset: bool,
    opc: bool,
    clock: SharedClock,
}

impl RampSensor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        stimulus: SharedStimulus,
        sensor: Box<dyn Sensor>,
        detect: SharedLimit,
        start: f64,
        stop: f64,
        step: f64,
        delay: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.to_string(),
            stimulus,
            sensor,
            detect,
            start,
            stop,
            step,
            delay,
            reset: true,
            opc: false,
            clock,
        }
    }

    /// Return the stimulus to its pre-ramp level afterwards.
    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Wait for operation-complete between steps.
    pub fn opc(mut self, opc: bool) -> Self {
        self.opc = opc;
        self
    }

    fn ramp(&mut self) -> Result<ReadingValue, SensorError> {
        for value in stepped_sequence(self.start, self.stop, self.step) {
            {
                let mut stimulus = lock(&self.stimulus);
                stimulus.output(value)?;
                if self.opc {
                    stimulus.opc()?;
                }
            }
            self.clock.sleep(self.delay);
            let reading = self.sensor.read()?;
            if self.detect.check(&reading) {
                debug!(sensor = %self.name, value, %reading, "ramp detected");
                return Ok(ReadingValue::Number(value));
            }
        }
        debug!(sensor = %self.name, stop = self.stop, "ramp finished without detection");
        Ok(ReadingValue::Number(self.stop))
    }
}

impl Sensor for RampSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        self.sensor.configure()
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        let original = lock(&self.stimulus).level();
        let result = self.ramp();
        if self.reset {
            let restored = lock(&self.stimulus).output(original);
            if let Err(e) = restored {
                warn!(sensor = %self.name, error = %e, "ramp reset failed");
                if result.is_ok() {
                    return Err(e.into());
                }
            }
        }
        result
    }

    fn single_shot(&self) -> bool {
        true
    }

    fn reset_transients(&mut self) {
        self.sensor.reset_transients();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepped_sequence_inclusive() {
        let values = stepped_sequence(4.0, 10.0, 0.5);
        assert_eq!(values.len(), 13);
        assert_eq!(values[6], 7.0);
        assert_eq!(values[12], 10.0);
    }

    #[test]
    fn test_stepped_sequence_downward_and_degenerate() {
        assert_eq!(stepped_sequence(5.0, 3.0, -1.0), vec![5.0, 4.0, 3.0]);
        assert_eq!(stepped_sequence(5.0, 3.0, 1.0), vec![5.0]);
        assert_eq!(stepped_sequence(1.0, 2.0, 0.0), vec![1.0]);
    }
}
