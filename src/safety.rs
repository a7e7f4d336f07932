use std::fmt::Display;

use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::console::SharedConsole;
use crate::sensors::instrument::lock;

const MAX_SAFETY_EVENTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub action: String,
    pub succeeded: bool,
    pub detail: Option<String>,
}

/// Records the teardown that returns a bench to a safe state.
///
/// Every action runs regardless of earlier failures. Failures are logged
/// and kept in a bounded history; they never abort the teardown.
#[derive(Debug, Default)]
pub struct SafetyManager {
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
    failures: usize,
    attempts: usize,
}

impl SafetyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one teardown action. Returns whether it
    /// succeeded.
    pub fn attempt<E: Display>(&mut self, action: &str, result: Result<(), E>) -> bool {
        self.attempts += 1;
        let record = match result {
            Ok(()) => {
                info!(action, "safety action done");
                SafetyEventRecord {
                    action: action.to_string(),
                    succeeded: true,
                    detail: None,
                }
            }
            Err(e) => {
                warn!(action, error = %e, "safety action failed");
                self.failures += 1;
                SafetyEventRecord {
                    action: action.to_string(),
                    succeeded: false,
                    detail: Some(e.to_string()),
                }
            }
        };
        let succeeded = record.succeeded;
        self.record_event(record);
        succeeded
    }

    fn record_event(&mut self, record: SafetyEventRecord) {
        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(record);
    }

    /// Close every console, swallowing and recording close failures.
    pub fn close_consoles<'a>(&mut self, consoles: impl IntoIterator<Item = (&'a String, &'a SharedConsole)>) {
        for (name, console) in consoles {
            let result = lock(console).close();
            self.attempt(&format!("close console {}", name), result);
        }
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_do_not_stop_teardown() {
        let mut safety = SafetyManager::new();
        assert!(!safety.attempt("ac off", Err("source not responding")));
        assert!(safety.attempt::<String>("load off", Ok(())));
        assert_eq!(safety.attempts(), 2);
        assert_eq!(safety.failures(), 1);
        assert_eq!(safety.get_event_history()[0].detail.as_deref(), Some("source not responding"));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut safety = SafetyManager::new();
        for i in 0..40 {
            safety.attempt::<String>(&format!("relay {}", i), Ok(()));
        }
        assert_eq!(safety.get_event_history().len(), MAX_SAFETY_EVENTS);
        assert_eq!(safety.get_event_history()[0].action, "relay 8");
    }
}
