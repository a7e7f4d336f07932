//! A measurement binds a sensor to a limit and turns one call into exactly
//! one [`MeasurementResult`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::limits::SharedLimit;
use crate::sensors::instrument::lock;
use crate::sensors::{ReadingValue, SensorError, SharedSensor};
use crate::timing::Clock;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Console timeout, echo mismatch or unparsable reply.
    Protocol,
    /// A mirror had nothing queued.
    NoValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail(String),
    Abort(String),
    Error { kind: ErrorKind, detail: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Fail(reason) => write!(f, "FAIL ({})", reason),
            Verdict::Abort(reason) => write!(f, "ABORT ({})", reason),
            Verdict::Error { kind, detail } => write!(f, "ERROR {:?} ({})", kind, detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    pub measurement: String,
    pub sensor: String,
    pub limit: String,
    pub position: usize,
    pub reading: Option<ReadingValue>,
    pub verdict: Verdict,
    /// Whether a non-pass verdict fails the UUT.
    pub counts: bool,
}

impl MeasurementResult {
    pub fn is_pass(&self) -> bool {
        self.verdict.is_pass()
    }

    pub fn is_counting_failure(&self) -> bool {
        self.counts && !self.is_pass()
    }
}

/// A sensor error that aborts the step. The aborted result is still
/// attached so the caller can record it.
#[derive(Debug, Error)]
#[error("measurement {}: {}", .result.measurement, .source)]
pub struct MeasurementError {
    pub result: Box<MeasurementResult>,
    #[source]
    pub source: SensorError,
}

pub struct Measurement {
    name: String,
    limit: SharedLimit,
    sensor: SharedSensor,
    timeout: Option<Duration>,
    retry_interval: Duration,
}

impl Measurement {
    pub fn new(name: &str, limit: SharedLimit, sensor: SharedSensor) -> Self {
        Self {
            name: name.to_string(),
            limit,
            sensor,
            timeout: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Keep retrying a failing reading until `timeout` has elapsed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> &SharedLimit {
        &self.limit
    }

    pub fn sensor(&self) -> &SharedSensor {
        &self.sensor
    }

    fn result(&self, sensor: &str, position: usize, reading: Option<ReadingValue>, verdict: Verdict) -> MeasurementResult {
        MeasurementResult {
            measurement: self.name.clone(),
            sensor: sensor.to_string(),
            limit: self.limit.to_string(),
            position,
            reading,
            verdict,
            counts: self.limit.position_fail(),
        }
    }

    fn abort(&self, sensor: &str, position: usize, source: SensorError) -> MeasurementError {
        warn!(measurement = %self.name, error = %source, "measurement aborted");
        let result = self.result(sensor, position, None, Verdict::Abort(source.to_string()));
        MeasurementError {
            result: Box::new(result),
            source,
        }
    }

    /// Configure the sensor, then read until the limit passes or the
    /// timeout runs out.
    pub fn measure(&self, clock: &dyn Clock) -> Result<MeasurementResult, MeasurementError> {
        let mut sensor = lock(&self.sensor);
        let sensor_name = sensor.name().to_string();
        let position = sensor.position();

        if let Err(e) = sensor.configure() {
            if !e.is_measurement_failure() {
                return Err(self.abort(&sensor_name, position, e));
            }
            let verdict = error_verdict(&e);
            return Ok(self.finish(self.result(&sensor_name, position, None, verdict)));
        }

        let polled = !sensor.single_shot() && self.timeout.is_some();
        let deadline = self.timeout.map(|t| clock.now() + t);
        let mut last_reading = None;
        let mut last_error: Option<SensorError>;

        loop {
            match sensor.read() {
                Ok(value) => {
                    if self.limit.check(&value) {
                        return Ok(self.finish(self.result(&sensor_name, position, Some(value), Verdict::Pass)));
                    }
                    debug!(measurement = %self.name, reading = %value, "reading outside limit");
                    last_reading = Some(value);
                    last_error = None;
                }
                Err(e) if e.is_measurement_failure() => {
                    debug!(measurement = %self.name, error = %e, "reading failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(self.abort(&sensor_name, position, e)),
            }

            let expired = deadline.map_or(true, |d| clock.now() >= d);
            if !polled || expired {
                break;
            }
            clock.sleep(self.retry_interval);
        }

        let verdict = match (&last_reading, &last_error) {
            (_, Some(e)) => error_verdict(e),
            (Some(value), None) => Verdict::Fail(format!("{} outside {}", value, self.limit)),
            (None, None) => Verdict::Fail("no reading".to_string()),
        };
        Ok(self.finish(self.result(&sensor_name, position, last_reading, verdict)))
    }

    fn finish(&self, result: MeasurementResult) -> MeasurementResult {
        let reading = result.reading.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);
        info!(
            measurement = %self.name,
            reading = %reading,
            verdict = %result.verdict,
            position = result.position,
            "measured"
        );
        result
    }
}

fn error_verdict(error: &SensorError) -> Verdict {
    let kind = match error {
        SensorError::Empty(_) => ErrorKind::NoValue,
        _ => ErrorKind::Protocol,
    };
    Verdict::Error {
        kind,
        detail: error.to_string(),
    }
}

impl fmt::Debug for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Measurement")
            .field("name", &self.name)
            .field("limit", &self.limit.to_string())
            .field("timeout", &self.timeout)
            .finish()
    }
}
