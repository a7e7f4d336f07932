//! Operator dialogs consumed as a capability.
//!
//! The GUI that shows the dialogs is outside this crate; it implements
//! [`Operator`]. FIFO runs use [`SimOperator`] with queued answers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use super::instrument::lock;
use super::{ReadingValue, Sensor, SensorError};
use crate::timing::SharedClock;

pub trait Operator: Send {
    /// `None` when the operator cancels.
    fn yes_no(&mut self, prompt: &str) -> Option<bool>;
    /// `None` when the operator cancels.
    fn text_entry(&mut self, prompt: &str) -> Option<String>;
    /// Show an adjustment prompt; `false` means the operator gave up.
    fn adjust_prompt(&mut self, prompt: &str) -> bool;
}

pub type SharedOperator = Arc<Mutex<dyn Operator>>;

#[derive(Debug, Default)]
struct SimOperatorState {
    answers: VecDeque<Option<bool>>,
    entries: VecDeque<Option<String>>,
    adjustments: VecDeque<bool>,
    prompts: Vec<String>,
}

/// Scripted operator. An exhausted queue answers as a cancel.
#[derive(Debug, Clone, Default)]
pub struct SimOperator {
    state: Arc<Mutex<SimOperatorState>>,
}

impl SimOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, answer: Option<bool>) {
        lock(&self.state).answers.push_back(answer);
    }

    pub fn enter(&self, entry: Option<&str>) {
        lock(&self.state).entries.push_back(entry.map(str::to_string));
    }

    pub fn keep_adjusting(&self, keep: bool) {
        lock(&self.state).adjustments.push_back(keep);
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state).prompts.clone()
    }

    pub fn shared(&self) -> SharedOperator {
        Arc::new(Mutex::new(self.clone()))
    }
}

impl Operator for SimOperator {
    fn yes_no(&mut self, prompt: &str) -> Option<bool> {
        let mut state = lock(&self.state);
        state.prompts.push(prompt.to_string());
        state.answers.pop_front().flatten()
    }

    fn text_entry(&mut self, prompt: &str) -> Option<String> {
        let mut state = lock(&self.state);
        state.prompts.push(prompt.to_string());
        state.entries.pop_front().flatten()
    }

    fn adjust_prompt(&mut self, prompt: &str) -> bool {
        let mut state = lock(&self.state);
        state.prompts.push(prompt.to_string());
        state.adjustments.pop_front().unwrap_or(false)
    }
}

pub struct YesNoSensor {
    name: String,
    operator: SharedOperator,
    prompt: String,
}

impl YesNoSensor {
    pub fn new(name: &str, operator: SharedOperator, prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            operator,
            prompt: prompt.to_string(),
        }
    }
}

impl Sensor for YesNoSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        lock(&self.operator)
            .yes_no(&self.prompt)
            .map(ReadingValue::Bool)
            .ok_or_else(|| SensorError::Cancelled(self.name.clone()))
    }

    fn single_shot(&self) -> bool {
        // A dialog is answered once; polling would re-prompt.
        true
    }
}

/// Free text or serial-number entry.
pub struct DataEntrySensor {
    name: String,
    operator: SharedOperator,
    prompt: String,
}

impl DataEntrySensor {
    pub fn new(name: &str, operator: SharedOperator, prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            operator,
            prompt: prompt.to_string(),
        }
    }
}

impl Sensor for DataEntrySensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        lock(&self.operator)
            .text_entry(&self.prompt)
            .map(ReadingValue::Text)
            .ok_or_else(|| SensorError::Cancelled(self.name.clone()))
    }

    fn single_shot(&self) -> bool {
        true
    }
}

/// Asks the operator to trim a potentiometer until the paired sensor reads
/// inside `[low, high]`. Reads `true` once inside, `false` on cancel.
pub struct AdjustAnalogSensor {
    name: String,
    operator: SharedOperator,
    sensor: Box<dyn Sensor>,
    low: f64,
    high: f64,
    poll: Duration,
    clock: SharedClock,
}

impl AdjustAnalogSensor {
    pub fn new(
        name: &str,
        operator: SharedOperator,
        sensor: Box<dyn Sensor>,
        low: f64,
        high: f64,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.to_string(),
            operator,
            sensor,
            low,
            high,
            poll: Duration::from_millis(200),
            clock,
        }
    }

    pub fn poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

impl Sensor for AdjustAnalogSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self) -> Result<(), SensorError> {
        self.sensor.configure()
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        loop {
            let reading = self.sensor.read()?;
            if let Some(value) = reading.as_f64() {
                if value >= self.low && value <= self.high {
                    info!(sensor = %self.name, value, "adjustment within window");
                    return Ok(ReadingValue::Bool(true));
                }
            }
            let prompt = format!(
                "Adjust {} into [{}, {}], currently {}",
                self.sensor.name(),
                self.low,
                self.high,
                reading
            );
            if !lock(&self.operator).adjust_prompt(&prompt) {
                info!(sensor = %self.name, "adjustment cancelled");
                return Ok(ReadingValue::Bool(false));
            }
            self.clock.sleep(self.poll);
        }
    }

    fn single_shot(&self) -> bool {
        true
    }

    fn reset_transients(&mut self) {
        self.sensor.reset_transients();
    }
}
