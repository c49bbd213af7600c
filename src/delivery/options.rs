//! Motor driver settings, sent to the controller as an acknowledged batch
use serde::{Deserialize, Serialize};

use super::DeviceCommand;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorOptions {
    /// `MST`, e.g. "FORCED BLOW OFF"
    pub control_state: String,
    /// `MSI`
    pub acceleration: f64,
    /// `MSF`
    pub speed_fast: f64,
    /// `MSM`
    pub speed_medium: f64,
    /// `MSS`
    pub speed_slow: f64,
    /// `MDM`
    pub distance_medium: f64,
    /// `MDC`
    pub distance_close: f64,
    /// `MDOP`
    pub distance_on_point: f64,
    /// `MIIP`, in Pa
    pub min_pressure: f64,
    /// `MAIP`, in Pa
    pub max_pressure: f64,
    /// `MTI`, motor control refresh in ms
    pub refresh_interval: f64,
}

impl Default for MotorOptions {
    fn default() -> Self {
        Self {
            control_state: "FORCED BLOW OFF".into(),
            acceleration: 10.0,
            speed_fast: 120.0,
            speed_medium: 70.0,
            speed_slow: 40.0,
            distance_medium: 80.0,
            distance_close: 20.0,
            distance_on_point: 4.0,
            min_pressure: 215_000.0,
            max_pressure: 750_000.0,
            refresh_interval: 30.0,
        }
    }
}

impl MotorOptions {
    /// One `Option` command per setting, in the order the firmware expects
    pub fn commands(&self) -> Vec<DeviceCommand> {
        let option = |name: &str, value: String| DeviceCommand::Option {
            name: name.to_string(),
            value,
        };
        let rounded = |value: f64| format!("{}", value.round() as i64);

        vec![
            option("MST", self.control_state.clone()),
            option("MSI", rounded(self.acceleration)),
            option("MSF", rounded(self.speed_fast)),
            option("MSM", rounded(self.speed_medium)),
            option("MSS", rounded(self.speed_slow)),
            option("MDM", rounded(self.distance_medium)),
            option("MDC", rounded(self.distance_close)),
            option("MDOP", rounded(self.distance_on_point)),
            option("MIIP", rounded(self.min_pressure)),
            option("MAIP", rounded(self.max_pressure)),
            option("MTI", rounded(self.refresh_interval)),
        ]
    }
}
