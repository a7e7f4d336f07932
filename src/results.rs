use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::measurement::MeasurementResult;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("failed to write results: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode results: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-UUT verdict letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "P")]
    Pass,
    #[serde(rename = "F")]
    Fail,
    #[serde(rename = "A")]
    Abort,
}

impl ResultCode {
    pub fn letter(self) -> char {
        match self {
            ResultCode::Pass => 'P',
            ResultCode::Fail => 'F',
            ResultCode::Abort => 'A',
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UutResult {
    pub position: usize,
    pub code: ResultCode,
    pub readings: Vec<MeasurementResult>,
    pub steps: Vec<String>,
    pub abort_reason: Option<String>,
}

impl UutResult {
    pub fn passed(&self) -> bool {
        self.code == ResultCode::Pass
    }

    pub fn failures(&self) -> impl Iterator<Item = &MeasurementResult> {
        self.readings.iter().filter(|r| !r.is_pass())
    }

    /// First result recorded for `measurement`.
    pub fn reading(&self, measurement: &str) -> Option<&MeasurementResult> {
        self.readings.iter().find(|r| r.measurement == measurement)
    }
}

/// Results of every UUT run in this session, in run order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResultLog {
    results: Vec<UutResult>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: UutResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[UutResult] {
        &self.results
    }

    /// Latest result for `position`.
    pub fn get(&self, position: usize) -> Option<&UutResult> {
        self.results.iter().rev().find(|r| r.position == position)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn to_json(&self) -> Result<String, ResultsError> {
        Ok(serde_json::to_string_pretty(&self.results)?)
    }

    pub fn export_json(&self, path: &Path) -> Result<(), ResultsError> {
        fs::write(path, self.to_json()?)?;
        info!(path = %path.display(), count = self.results.len(), "results exported");
        Ok(())
    }
}
