use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::instrument::lock;
use super::{ReadingValue, Sensor, SensorError};
use crate::signals::{SignalBus, SignalKind, SubscriptionId};

/// A sensor fed by step code rather than polled from hardware.
///
/// Producers call [`MirrorSensor::store`] ahead of the measurement; each
/// read pops the oldest value. Clones share the same queue, so a step can
/// hold a handle while the measurement owns another.
#[derive(Debug, Clone)]
pub struct MirrorSensor {
    name: String,
    values: Arc<Mutex<VecDeque<ReadingValue>>>,
    position: usize,
}

impl MirrorSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: Arc::new(Mutex::new(VecDeque::new())),
            position: 1,
        }
    }

    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    pub fn store(&self, value: impl Into<ReadingValue>) {
        let value = value.into();
        trace!(sensor = %self.name, %value, "mirror store");
        lock(&self.values).push_back(value);
    }

    pub fn clear(&self) {
        lock(&self.values).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.values).is_empty()
    }

    /// Empty this mirror whenever `bus` publishes a stop signal.
    pub fn watch(&self, bus: &SignalBus) -> SubscriptionId {
        let values = Arc::clone(&self.values);
        bus.subscribe(SignalKind::Stop, move |_| lock(&values).clear())
    }
}

impl Sensor for MirrorSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self) -> Result<ReadingValue, SensorError> {
        lock(&self.values)
            .pop_front()
            .ok_or_else(|| SensorError::Empty(self.name.clone()))
    }

    fn position(&self) -> usize {
        self.position
    }

    fn reset_transients(&mut self) {
        self.clear();
    }

    fn single_shot(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Signal;

    #[test]
    fn test_fifo_order() {
        let mut mirror = MirrorSensor::new("exit");
        mirror.store("ok");
        mirror.store(3.0);
        assert_eq!(mirror.read().unwrap(), ReadingValue::Text("ok".into()));
        assert_eq!(mirror.read().unwrap(), ReadingValue::Number(3.0));
        assert!(matches!(mirror.read(), Err(SensorError::Empty(_))));
    }

    #[test]
    fn test_stop_signal_clears() {
        let bus = SignalBus::new();
        let mirror = MirrorSensor::new("event");
        mirror.watch(&bus);
        mirror.store(true);
        bus.publish(&Signal::Stop { position: 1, code: None });
        assert!(mirror.is_empty());
    }
}
