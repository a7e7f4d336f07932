//! Typed parameter tables.
//!
//! Each console keeps a static mapping from a human key to a [`Parameter`]
//! descriptor. The descriptor knows how to render the read and write
//! commands and how to code the value on the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Console, ConsoleError};

pub const DEFAULT_READ_FORMAT: &str = "\"{0} XN?";
pub const DEFAULT_WRITE_FORMAT: &str = "{0} \"{1} XN!";
pub const CAN_READ_FORMAT: &str = "\"{0} CAN";
pub const CAL_WRITE_FORMAT: &str = "{0} \"{1} CAL";

/// Target state of an override parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideState {
    Normal = 0,
    ForceOff = 1,
    ForceOn = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexStyle {
    /// `$HHHHHHHH`
    Dollar,
    /// `0xHHHHHHHH`, newer firmware
    ZeroX,
}

/// Reads a composite value by issuing its own commands.
pub type RawFn = fn(&mut Console) -> Result<ParamValue, ConsoleError>;

#[derive(Clone)]
pub enum Coding {
    String,
    Boolean,
    Float { min: f64, max: f64, scale: f64 },
    Hex { min: u32, max: u32, mask: u32, style: HexStyle },
    Can,
    Calibration { scale: f64 },
    Override,
    Raw(RawFn),
}

impl fmt::Debug for Coding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coding::String => f.write_str("String"),
            Coding::Boolean => f.write_str("Boolean"),
            Coding::Float { min, max, scale } => f
                .debug_struct("Float")
                .field("min", min)
                .field("max", max)
                .field("scale", scale)
                .finish(),
            Coding::Hex { min, max, mask, style } => f
                .debug_struct("Hex")
                .field("min", min)
                .field("max", max)
                .field("mask", mask)
                .field("style", style)
                .finish(),
            Coding::Can => f.write_str("Can"),
            Coding::Calibration { scale } => f.debug_struct("Calibration").field("scale", scale).finish(),
            Coding::Override => f.write_str("Override"),
            Coding::Raw(_) => f.write_str("Raw"),
        }
    }
}

/// A decoded parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Bool(bool),
    Float(f64),
    Hex(u32),
    Override(OverrideState),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Str(s) => write!(f, "{}", s),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Hex(v) => write!(f, "0x{:08X}", v),
            ParamValue::Override(state) => write!(f, "{:?}", state),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub verb: String,
    pub readable: bool,
    pub writable: bool,
    pub read_format: String,
    pub write_format: String,
    pub read_expected: usize,
    pub write_expected: usize,
    pub coding: Coding,
}

impl Parameter {
    fn with_coding(verb: &str, coding: Coding) -> Self {
        Self {
            verb: verb.to_string(),
            readable: true,
            writable: false,
            read_format: DEFAULT_READ_FORMAT.to_string(),
            write_format: DEFAULT_WRITE_FORMAT.to_string(),
            read_expected: 1,
            write_expected: 0,
            coding,
        }
    }

    pub fn string(verb: &str) -> Self {
        Self::with_coding(verb, Coding::String)
    }

    pub fn boolean(verb: &str) -> Self {
        Self::with_coding(verb, Coding::Boolean)
    }

    pub fn float(verb: &str, scale: f64) -> Self {
        Self::with_coding(
            verb,
            Coding::Float {
                min: f64::NEG_INFINITY,
                max: f64::INFINITY,
                scale,
            },
        )
    }

    pub fn hex(verb: &str, mask: u32) -> Self {
        Self::with_coding(
            verb,
            Coding::Hex {
                min: 0,
                max: u32::MAX,
                mask,
                style: HexStyle::Dollar,
            },
        )
    }

    pub fn can(verb: &str) -> Self {
        let mut param = Self::with_coding(verb, Coding::Can);
        param.read_format = CAN_READ_FORMAT.to_string();
        param
    }

    pub fn calibration(verb: &str, scale: f64) -> Self {
        let mut param = Self::with_coding(verb, Coding::Calibration { scale });
        param.readable = false;
        param.writable = true;
        param.write_format = CAL_WRITE_FORMAT.to_string();
        param
    }

    pub fn override_state(verb: &str) -> Self {
        let mut param = Self::with_coding(verb, Coding::Override);
        param.readable = false;
        param.writable = true;
        param
    }

    pub fn raw(function: RawFn) -> Self {
        Self::with_coding("", Coding::Raw(function))
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn read_format(mut self, format: &str) -> Self {
        self.read_format = format.to_string();
        self
    }

    pub fn write_format(mut self, format: &str) -> Self {
        self.write_format = format.to_string();
        self
    }

    pub fn read_expected(mut self, lines: usize) -> Self {
        self.read_expected = lines;
        self
    }

    pub fn write_expected(mut self, lines: usize) -> Self {
        self.write_expected = lines;
        self
    }

    /// Inclusive bounds enforced on write. Applies to float and hex codings.
    pub fn range(mut self, low: f64, high: f64) -> Self {
        match &mut self.coding {
            Coding::Float { min, max, .. } => {
                *min = low;
                *max = high;
            }
            Coding::Hex { min, max, .. } => {
                *min = low as u32;
                *max = high as u32;
            }
            _ => {}
        }
        self
    }

    pub fn hex_style(mut self, hex_style: HexStyle) -> Self {
        if let Coding::Hex { style, .. } = &mut self.coding {
            *style = hex_style;
        }
        self
    }

    pub fn read_command(&self) -> String {
        self.read_format.replace("{0}", &self.verb)
    }

    fn write_command(&self, value: &str) -> String {
        self.write_format.replace("{0}", value).replace("{1}", &self.verb)
    }

    /// Render the write command for `value`, enforcing the coding.
    pub fn encode(&self, key: &str, value: &ParamValue) -> Result<String, ConsoleError> {
        if !self.writable {
            return Err(ConsoleError::NotWritable(key.to_string()));
        }
        let wrong_type = || ConsoleError::WrongValueType {
            key: key.to_string(),
            value: value.to_string(),
        };
        let text = match (&self.coding, value) {
            (Coding::String, ParamValue::Str(s)) => s.clone(),
            (Coding::Boolean, ParamValue::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
            (Coding::Float { min, max, scale }, ParamValue::Float(v)) => {
                if !v.is_finite() || v < min || v > max {
                    return Err(ConsoleError::OutOfRange {
                        key: key.to_string(),
                        value: *v,
                        min: *min,
                        max: *max,
                    });
                }
                format!("{}", (v * scale).round() as i64)
            }
            (Coding::Hex { min, max, style, .. }, ParamValue::Hex(v)) => {
                if v < min || v > max {
                    return Err(ConsoleError::OutOfRange {
                        key: key.to_string(),
                        value: f64::from(*v),
                        min: f64::from(*min),
                        max: f64::from(*max),
                    });
                }
                match style {
                    HexStyle::Dollar => format!("${:08X}", v),
                    HexStyle::ZeroX => format!("0x{:08X}", v),
                }
            }
            (Coding::Calibration { scale }, ParamValue::Float(v)) => {
                if !v.is_finite() {
                    return Err(ConsoleError::OutOfRange {
                        key: key.to_string(),
                        value: *v,
                        min: f64::MIN,
                        max: f64::MAX,
                    });
                }
                format!("{}", (v * scale).round() as i64)
            }
            (Coding::Override, ParamValue::Override(state)) => format!("{}", *state as u8),
            _ => return Err(wrong_type()),
        };
        Ok(self.write_command(&text))
    }

    /// Convert a reply into a typed value.
    pub fn decode(&self, key: &str, reply: &str) -> Result<ParamValue, ConsoleError> {
        let text = reply.trim();
        let parse_error = || ConsoleError::Parse {
            key: key.to_string(),
            reply: reply.to_string(),
        };
        match &self.coding {
            Coding::String | Coding::Can => Ok(ParamValue::Str(text.to_string())),
            Coding::Boolean => text
                .parse::<i64>()
                .map(|v| ParamValue::Bool(v != 0))
                .map_err(|_| parse_error()),
            Coding::Float { scale, .. } => text
                .parse::<f64>()
                .map(|v| ParamValue::Float(v / scale))
                .map_err(|_| parse_error()),
            Coding::Hex { mask, .. } => parse_integer(text)
                .map(|v| ParamValue::Hex(v & mask))
                .ok_or_else(parse_error),
            Coding::Calibration { .. } | Coding::Override | Coding::Raw(_) => {
                Err(ConsoleError::NotReadable(key.to_string()))
            }
        }
    }
}

/// Parse `$HHHH`, `0xHHHH` or a decimal integer.
pub fn parse_integer(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix('$') {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Ok(v) = text.parse::<u32>() {
        Some(v)
    } else {
        text.parse::<i64>().ok().map(|v| v as u32)
    }
}

/// Key → descriptor mapping for one console.
#[derive(Debug, Clone, Default)]
pub struct ParameterTable {
    entries: BTreeMap<String, Parameter>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, parameter: Parameter) -> Self {
        self.insert(key, parameter);
        self
    }

    pub fn insert(&mut self, key: &str, parameter: Parameter) {
        self.entries.insert(key.to_string(), parameter);
    }

    pub fn get(&self, key: &str) -> Option<&Parameter> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_encoding_scales_and_rounds() {
        let param = Parameter::float("VOUT", 1000.0).writable().range(0.0, 15.0);
        assert_eq!(param.encode("VOUT", &ParamValue::Float(12.0004)).unwrap(), "12000 \"VOUT XN!");
        assert!(param.encode("VOUT", &ParamValue::Float(15.0)).is_ok());
        assert!(param.encode("VOUT", &ParamValue::Float(0.0)).is_ok());
        assert!(matches!(
            param.encode("VOUT", &ParamValue::Float(15.001)),
            Err(ConsoleError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_non_finite_floats_rejected() {
        let param = Parameter::float("VOUT", 1000.0).writable().range(0.0, 15.0);
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                param.encode("VOUT", &ParamValue::Float(v)),
                Err(ConsoleError::OutOfRange { .. })
            ));
        }
        let cal = Parameter::calibration("PFC", 1.0);
        assert!(matches!(
            cal.encode("CAL_PFC", &ParamValue::Float(f64::NAN)),
            Err(ConsoleError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_hex_styles() {
        let param = Parameter::hex("STATUS", 0xFFFF_FFFF).writable();
        assert_eq!(param.encode("S", &ParamValue::Hex(0x8000_0000)).unwrap(), "$80000000 \"STATUS XN!");
        let param = param.hex_style(HexStyle::ZeroX);
        assert_eq!(param.encode("S", &ParamValue::Hex(0x10)).unwrap(), "0x00000010 \"STATUS XN!");
    }

    #[test]
    fn test_hex_decode_masks() {
        let param = Parameter::hex("STATUS", 0x0000_FFFF);
        assert_eq!(param.decode("S", "$1234ABCD").unwrap(), ParamValue::Hex(0xABCD));
        assert_eq!(param.decode("S", "0x00000010").unwrap(), ParamValue::Hex(0x10));
    }

    #[test]
    fn test_write_only_and_read_only() {
        let cal = Parameter::calibration("VSET", 1000.0);
        assert_eq!(cal.encode("CAL", &ParamValue::Float(11.9876)).unwrap(), "11988 \"VSET CAL");
        assert!(matches!(cal.decode("CAL", "1"), Err(ConsoleError::NotReadable(_))));

        let can = Parameter::can("STATUS");
        assert_eq!(can.read_command(), "\"STATUS CAN");
        assert!(matches!(can.encode("C", &ParamValue::Str("x".into())), Err(ConsoleError::NotWritable(_))));
    }

    #[test]
    fn test_override_encoding() {
        let param = Parameter::override_state("FAN");
        assert_eq!(
            param.encode("FAN", &ParamValue::Override(OverrideState::ForceOn)).unwrap(),
            "2 \"FAN XN!"
        );
    }

    #[test]
    fn test_wrong_value_type() {
        let param = Parameter::boolean("ENABLE").writable();
        assert!(matches!(
            param.encode("E", &ParamValue::Float(1.0)),
            Err(ConsoleError::WrongValueType { .. })
        ));
    }
}
