use std::fmt;
use std::mem::discriminant;
use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use thiserror::Error;

use crate::sensors::ReadingValue;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("limit {name}: cannot change kind from {from} to {to}")]
    KindChange { name: String, from: String, to: String },
    #[error("limit {name}: invalid regular expression: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("limit {name}: lower bound {low} above upper bound {high}")]
    Inverted { name: String, low: f64, high: f64 },
}

/// The comparison rule behind a [`Limit`].
#[derive(Debug, Clone)]
pub enum LimitKind {
    Lower(f64),
    Upper(f64),
    Between { low: f64, high: f64 },
    Percent { nominal: f64, percent: f64 },
    Regex(Regex),
    Boolean(bool),
}

impl LimitKind {
    fn label(&self) -> &'static str {
        match self {
            LimitKind::Lower(_) => "lower",
            LimitKind::Upper(_) => "upper",
            LimitKind::Between { .. } => "between",
            LimitKind::Percent { .. } => "percent",
            LimitKind::Regex(_) => "regex",
            LimitKind::Boolean(_) => "boolean",
        }
    }

    fn check(&self, value: &ReadingValue) -> bool {
        match (self, value) {
            (LimitKind::Lower(low), ReadingValue::Number(v)) => v >= low,
            (LimitKind::Upper(high), ReadingValue::Number(v)) => v <= high,
            (LimitKind::Between { low, high }, ReadingValue::Number(v)) => v >= low && v <= high,
            (LimitKind::Percent { nominal, percent }, ReadingValue::Number(v)) => {
                (v - nominal).abs() <= (nominal * percent / 100.0).abs()
            }
            (LimitKind::Regex(re), ReadingValue::Text(text)) => re.is_match(text),
            (LimitKind::Boolean(expected), ReadingValue::Bool(b)) => b == expected,
            _ => false,
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Lower(low) => write!(f, ">= {}", low),
            LimitKind::Upper(high) => write!(f, "<= {}", high),
            LimitKind::Between { low, high } => write!(f, "[{}, {}]", low, high),
            LimitKind::Percent { nominal, percent } => write!(f, "{} ±{}%", nominal, percent),
            LimitKind::Regex(re) => write!(f, "~ {}", re.as_str()),
            LimitKind::Boolean(b) => write!(f, "== {}", b),
        }
    }
}

/// A named comparison rule. The kind is fixed once the limit is built;
/// only its parameters can move through [`Limit::adjust`].
#[derive(Debug)]
pub struct Limit {
    name: String,
    doc: String,
    kind: Mutex<LimitKind>,
    position_fail: bool,
}

pub type SharedLimit = Arc<Limit>;

impl Limit {
    fn build(name: &str, kind: LimitKind) -> Self {
        Self {
            name: name.to_string(),
            doc: String::new(),
            kind: Mutex::new(kind),
            position_fail: true,
        }
    }

    pub fn lower(name: &str, low: f64) -> Self {
        Self::build(name, LimitKind::Lower(low))
    }

    pub fn upper(name: &str, high: f64) -> Self {
        Self::build(name, LimitKind::Upper(high))
    }

    pub fn between(name: &str, low: f64, high: f64) -> Result<Self, LimitError> {
        if low > high {
            return Err(LimitError::Inverted { name: name.to_string(), low, high });
        }
        Ok(Self::build(name, LimitKind::Between { low, high }))
    }

    pub fn percent(name: &str, nominal: f64, percent: f64) -> Self {
        Self::build(name, LimitKind::Percent { nominal, percent })
    }

    pub fn regex(name: &str, pattern: &str) -> Result<Self, LimitError> {
        let re = Regex::new(pattern).map_err(|source| LimitError::Regex {
            name: name.to_string(),
            source,
        })?;
        Ok(Self::build(name, LimitKind::Regex(re)))
    }

    pub fn boolean(name: &str, expected: bool) -> Self {
        Self::build(name, LimitKind::Boolean(expected))
    }

    pub fn with_doc(mut self, doc: &str) -> Self {
        self.doc = doc.to_string();
        self
    }

    /// A failing reading is recorded but does not fail the UUT.
    pub fn recorded_only(mut self) -> Self {
        self.position_fail = false;
        self
    }

    pub fn shared(self) -> SharedLimit {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn position_fail(&self) -> bool {
        self.position_fail
    }

    pub fn kind(&self) -> LimitKind {
        self.kind.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn check(&self, value: &ReadingValue) -> bool {
        self.kind.lock().unwrap_or_else(PoisonError::into_inner).check(value)
    }

    /// Replace the limit parameters, e.g. re-centre a window after measuring
    /// a reference. The new kind must match the current one.
    pub fn adjust(&self, new_kind: LimitKind) -> Result<(), LimitError> {
        let mut kind = self.kind.lock().unwrap_or_else(PoisonError::into_inner);
        if discriminant(&*kind) != discriminant(&new_kind) {
            return Err(LimitError::KindChange {
                name: self.name.clone(),
                from: kind.label().to_string(),
                to: new_kind.label().to_string(),
            });
        }
        if let LimitKind::Between { low, high } = new_kind {
            if low > high {
                return Err(LimitError::Inverted { name: self.name.clone(), low, high });
            }
        }
        *kind = new_kind;
        Ok(())
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(v: f64) -> ReadingValue {
        ReadingValue::Number(v)
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let limit = Limit::between("Vout", 11.5, 12.5).unwrap();
        assert!(limit.check(&num(11.5)));
        assert!(limit.check(&num(12.5)));
        assert!(!limit.check(&num(12.500_001)));
        assert!(Limit::lower("lo", 1.0).check(&num(1.0)));
        assert!(Limit::upper("hi", 20.0).check(&num(20.0)));
        assert!(!Limit::upper("FanShort", 20.0).check(&num(30.0)));
    }

    #[test]
    fn test_percent_window() {
        let limit = Limit::percent("Vbus", 400.0, 2.0);
        assert!(limit.check(&num(408.0)));
        assert!(limit.check(&num(392.0)));
        assert!(!limit.check(&num(408.5)));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let limit = Limit::regex("Mac", "^[0-9A-F]{12}$").unwrap();
        assert!(limit.check(&ReadingValue::Text("001EC030BC15".into())));
        assert!(!limit.check(&num(1.0)));
        assert!(!Limit::boolean("Ok", true).check(&num(1.0)));
    }

    #[test]
    fn test_adjust_keeps_kind() {
        let limit = Limit::between("Stable", 439.3, 440.8).unwrap();
        limit.adjust(LimitKind::Between { low: 430.0, high: 432.0 }).unwrap();
        assert!(limit.check(&num(431.0)));
        assert!(limit.adjust(LimitKind::Upper(5.0)).is_err());
        assert!(matches!(limit.kind(), LimitKind::Between { .. }));
    }

    #[test]
    fn test_inverted_window_rejected() {
        assert!(Limit::between("Bad", 2.0, 1.0).is_err());
    }
}
