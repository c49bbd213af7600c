use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ScheduleError;
use crate::units::{convert_time, split_quantity, PressureUnit, TimeUnit, MAX_DURATION};

/// One setpoint held for a dwell time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStep {
    /// Value sent with `PSET`, in Pa
    pub setpoint: f64,
    pub dwell: f64,
    #[serde(default)]
    pub dwell_unit: TimeUnit,
    /// 0..=100
    #[serde(default)]
    pub progress: u8,
}

impl ScheduleStep {
    pub fn new(setpoint: f64, dwell: f64, dwell_unit: TimeUnit) -> Self {
        Self {
            setpoint,
            dwell,
            dwell_unit,
            progress: 0,
        }
    }

    /// Reject setpoints and dwells no timer can represent
    pub fn validate(&self) -> Result<(), ScheduleError> {
        let invalid = |why: &str| ScheduleError::InvalidStep(format!("{}: {}", self, why));
        if !self.setpoint.is_finite() {
            return Err(invalid("setpoint must be finite"));
        }
        if !self.dwell.is_finite() || self.dwell < 0.0 {
            return Err(invalid("dwell must be a non-negative number"));
        }
        if convert_time(self.dwell, self.dwell_unit, TimeUnit::Seconds) > MAX_DURATION.as_secs_f64() {
            return Err(invalid("dwell is longer than a year"));
        }
        Ok(())
    }

    pub fn dwell_duration(&self) -> Duration {
        self.dwell_unit.to_duration(self.dwell)
    }

    /// Progress after `elapsed` in the dwell, rounded and clamped to 100
    pub fn progress_at(&self, elapsed: Duration) -> u8 {
        let dwell = self.dwell_duration();
        if dwell.is_zero() {
            return 100;
        }
        let percent = (elapsed.as_secs_f64() / dwell.as_secs_f64() * 100.0).round();
        percent.clamp(0.0, 100.0) as u8
    }
}

impl fmt::Display for ScheduleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.setpoint, self.dwell, self.dwell_unit)
    }
}

impl FromStr for ScheduleStep {
    type Err = ScheduleError;

    /// `<setpoint>[pressure unit]:<dwell>[time unit]`, for example `3bar:5min`
    /// or `300000:500ms`. Units default to Pa and seconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidStep(s.to_string());
        let (setpoint, dwell) = s.split_once(':').ok_or_else(invalid)?;

        let (value, unit) = split_quantity(setpoint).ok_or_else(invalid)?;
        let pressure_unit: PressureUnit = unit.parse().map_err(|_| invalid())?;
        let (dwell, unit) = split_quantity(dwell).ok_or_else(invalid)?;
        let dwell_unit: TimeUnit = unit.parse().map_err(|_| invalid())?;

        let step = ScheduleStep::new(pressure_unit.to_pascal(value), dwell, dwell_unit);
        step.validate()?;
        Ok(step)
    }
}

/// Ordered list of steps, as stored in schedule files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub steps: Vec<ScheduleStep>,
}

impl Schedule {
    pub fn new(steps: Vec<ScheduleStep>) -> Self {
        Self { steps }
    }

    /// Linear ramp from `from` to `to` Pa: `steps` points spaced by
    /// `spacing`, then the end point. With `hysteresis` the ramp is walked
    /// back down afterwards.
    pub fn ramp(from: f64, to: f64, spacing: f64, steps: usize, dwell: f64, dwell_unit: TimeUnit, hysteresis: bool) -> Self {
        let mut points: Vec<f64> = (0..steps).map(|i| from + i as f64 * spacing).collect();
        points.push(to);
        if hysteresis {
            points.extend((0..steps).rev().map(|i| from + i as f64 * spacing));
        }

        Self {
            steps: points
                .into_iter()
                .map(|p| ScheduleStep::new(p, dwell, dwell_unit))
                .collect(),
        }
    }

    pub fn total_dwell(&self) -> Duration {
        self.steps.iter().map(ScheduleStep::dwell_duration).sum()
    }

    pub fn from_toml(text: &str) -> Result<Self, ScheduleError> {
        let schedule: Schedule = toml::from_str(text).map_err(|e| ScheduleError::InvalidFile(e.to_string()))?;
        for step in &schedule.steps {
            step.validate()?;
        }
        Ok(schedule)
    }
}
