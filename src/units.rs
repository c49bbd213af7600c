//! Time and pressure units used by setpoint schedules
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown unit: {0}")]
pub struct UnknownUnit(pub String);

/// Longest duration any timer is armed with (one year)
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeUnit {
    #[serde(rename = "ms")]
    Milliseconds,
    #[default]
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "min")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
}

impl TimeUnit {
    fn millis_per_unit(&self) -> f64 {
        match self {
            TimeUnit::Milliseconds => 1.0,
            TimeUnit::Seconds => 1_000.0,
            TimeUnit::Minutes => 60_000.0,
            TimeUnit::Hours => 3_600_000.0,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "min",
            TimeUnit::Hours => "h",
        }
    }

    /// `value` in this unit as a duration. Negative or NaN values become
    /// zero; anything longer is capped at [`MAX_DURATION`].
    pub fn to_duration(&self, value: f64) -> Duration {
        let secs = value * self.millis_per_unit() / 1_000.0;
        if secs.is_nan() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).map_or(MAX_DURATION, |d| d.min(MAX_DURATION))
    }
}

pub fn convert_time(value: f64, from: TimeUnit, to: TimeUnit) -> f64 {
    value * from.millis_per_unit() / to.millis_per_unit()
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for TimeUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ms" => Ok(TimeUnit::Milliseconds),
            "s" | "" => Ok(TimeUnit::Seconds),
            "min" => Ok(TimeUnit::Minutes),
            "h" => Ok(TimeUnit::Hours),
            other => Err(UnknownUnit(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PressureUnit {
    #[default]
    #[serde(rename = "Pa")]
    Pascal,
    #[serde(rename = "kPa")]
    Kilopascal,
    #[serde(rename = "MPa")]
    Megapascal,
    #[serde(rename = "bar")]
    Bar,
}

impl PressureUnit {
    fn pascal_per_unit(&self) -> f64 {
        match self {
            PressureUnit::Pascal => 1.0,
            PressureUnit::Kilopascal => 1_000.0,
            PressureUnit::Megapascal => 1_000_000.0,
            PressureUnit::Bar => 100_000.0,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            PressureUnit::Pascal => "Pa",
            PressureUnit::Kilopascal => "kPa",
            PressureUnit::Megapascal => "MPa",
            PressureUnit::Bar => "bar",
        }
    }

    pub fn to_pascal(&self, value: f64) -> f64 {
        value * self.pascal_per_unit()
    }
}

pub fn convert_pressure(value: f64, from: PressureUnit, to: PressureUnit) -> f64 {
    value * from.pascal_per_unit() / to.pascal_per_unit()
}

impl fmt::Display for PressureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for PressureUnit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Pa" | "" => Ok(PressureUnit::Pascal),
            "kPa" => Ok(PressureUnit::Kilopascal),
            "MPa" => Ok(PressureUnit::Megapascal),
            "bar" => Ok(PressureUnit::Bar),
            other => Err(UnknownUnit(other.to_string())),
        }
    }
}

/// Split `"2.5min"` into `(2.5, "min")`
pub fn split_quantity(text: &str) -> Option<(f64, &str)> {
    let text = text.trim();
    let split = text
        .char_indices()
        .find(|(i, c)| c.is_ascii_alphabetic() && !is_exponent(text, *i))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    number.trim().parse::<f64>().ok().map(|value| (value, unit.trim()))
}

// "2e5Pa": an `e` followed by a digit or sign belongs to the number
fn is_exponent(text: &str, index: usize) -> bool {
    let bytes = text.as_bytes();
    if !matches!(bytes[index], b'e' | b'E') || index == 0 {
        return false;
    }
    matches!(bytes.get(index + 1), Some(b'0'..=b'9' | b'+' | b'-'))
}
