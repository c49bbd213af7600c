use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::serial::protocol;

/// Tag used for every host-to-device setting
pub const SET_TAG: &str = "s";

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Ticket handed out for every command accepted by a delivery machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl CommandId {
    pub(crate) fn next() -> Self {
        CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands understood by the controller firmware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    /// Pressure setpoint in Pa
    SetPoint { value: i64 },
    /// Absolute motor position
    SetAbsolutePosition { value: i64 },
    Calibrate,
    /// Motor option such as `MSF` (fast speed); the device echoes the name
    Option { name: String, value: String },
    EmergencyStop,
    PressureUp,
    PressureDown,
    Custom {
        tag: String,
        params: Vec<String>,
        ack: Option<String>,
    },
}

impl DeviceCommand {
    pub fn set_point(value: f64) -> Self {
        DeviceCommand::SetPoint {
            value: value.round() as i64,
        }
    }

    /// Tag and parameters, before framing
    pub fn payload(&self) -> (String, Vec<String>) {
        let set = |params: Vec<String>| (SET_TAG.to_string(), params);
        match self {
            DeviceCommand::SetPoint { value } => set(vec!["PSET".into(), value.to_string()]),
            DeviceCommand::SetAbsolutePosition { value } => set(vec!["APSET".into(), value.to_string()]),
            DeviceCommand::Calibrate => set(vec!["KAL".into()]),
            DeviceCommand::Option { name, value } => set(vec![name.clone(), value.clone()]),
            DeviceCommand::EmergencyStop => set(vec!["ES".into()]),
            DeviceCommand::PressureUp => set(vec!["TPU".into()]),
            DeviceCommand::PressureDown => set(vec!["TPD".into()]),
            DeviceCommand::Custom { tag, params, .. } => (tag.clone(), params.clone()),
        }
    }

    /// Framed string as it goes on the wire, without line terminator
    pub fn wire(&self) -> String {
        let (tag, params) = self.payload();
        protocol::encode(&tag, &params)
    }

    /// Parameter the device sends back in `r|<key>`. Commands without one
    /// are fire-and-forget and bypass the delivery machine.
    pub fn ack_key(&self) -> Option<String> {
        match self {
            DeviceCommand::SetPoint { .. } => Some("PSET".into()),
            DeviceCommand::SetAbsolutePosition { .. } => Some("APSET".into()),
            DeviceCommand::Calibrate => Some("KAL".into()),
            DeviceCommand::Option { name, .. } => Some(name.clone()),
            DeviceCommand::EmergencyStop | DeviceCommand::PressureUp | DeviceCommand::PressureDown => None,
            DeviceCommand::Custom { ack, .. } => ack.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("Empty command")]
    Empty,
    #[error("Missing value for {0}")]
    MissingValue(String),
    #[error("Invalid number: {0}")]
    InvalidNumber(String),
    #[error("Unknown command: {0}")]
    Unknown(String),
}

fn number(words: &mut std::str::SplitWhitespace<'_>, name: &str) -> Result<f64, CommandParseError> {
    let text = words
        .next()
        .ok_or_else(|| CommandParseError::MissingValue(name.to_string()))?;
    text.parse::<f64>()
        .map_err(|_| CommandParseError::InvalidNumber(text.to_string()))
}

impl FromStr for DeviceCommand {
    type Err = CommandParseError;

    /// Console syntax: `pset 300000`, `apset 1200`, `kal`, `es`, `tpu`, `tpd`,
    /// `opt MSF 400`, or `raw <tag> [params...]` for an unacknowledged frame.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let head = words.next().ok_or(CommandParseError::Empty)?;
        match head.to_ascii_lowercase().as_str() {
            "pset" => Ok(DeviceCommand::set_point(number(&mut words, "pset")?)),
            "apset" => Ok(DeviceCommand::SetAbsolutePosition {
                value: number(&mut words, "apset")?.round() as i64,
            }),
            "kal" => Ok(DeviceCommand::Calibrate),
            "es" => Ok(DeviceCommand::EmergencyStop),
            "tpu" => Ok(DeviceCommand::PressureUp),
            "tpd" => Ok(DeviceCommand::PressureDown),
            "opt" => {
                let name = words
                    .next()
                    .ok_or_else(|| CommandParseError::MissingValue("opt".into()))?;
                let value = words
                    .next()
                    .ok_or_else(|| CommandParseError::MissingValue(name.to_string()))?;
                Ok(DeviceCommand::Option {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            }
            "raw" => {
                let tag = words
                    .next()
                    .ok_or_else(|| CommandParseError::MissingValue("raw".into()))?;
                Ok(DeviceCommand::Custom {
                    tag: tag.to_string(),
                    params: words.map(str::to_string).collect(),
                    ack: None,
                })
            }
            _ => Err(CommandParseError::Unknown(head.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setpoint_wire_format() {
        let command = DeviceCommand::set_point(299_999.6);
        assert_eq!(command.wire(), "<s|PSET|300000|X>");
        assert_eq!(command.ack_key().as_deref(), Some("PSET"));
    }

    #[test]
    fn test_fire_and_forget_commands() {
        assert_eq!(DeviceCommand::EmergencyStop.wire(), "<s|ES|E>");
        assert!(DeviceCommand::EmergencyStop.ack_key().is_none());
        assert!(DeviceCommand::PressureUp.ack_key().is_none());
        assert!(DeviceCommand::PressureDown.ack_key().is_none());
    }

    #[test]
    fn test_option_acks_with_its_name() {
        let command = DeviceCommand::Option {
            name: "MSF".into(),
            value: "400".into(),
        };
        assert_eq!(command.ack_key().as_deref(), Some("MSF"));
        assert_eq!(
            protocol::decode(&command.wire()).as_deref(),
            Some("s|MSF|400|")
        );
    }

    #[test]
    fn test_parse_console_syntax() {
        assert_eq!("pset 300000".parse::<DeviceCommand>(), Ok(DeviceCommand::SetPoint { value: 300_000 }));
        assert_eq!("KAL".parse::<DeviceCommand>(), Ok(DeviceCommand::Calibrate));
        assert_eq!(
            "raw v PV".parse::<DeviceCommand>(),
            Ok(DeviceCommand::Custom {
                tag: "v".into(),
                params: vec!["PV".into()],
                ack: None
            })
        );
        assert_eq!(
            "pset".parse::<DeviceCommand>(),
            Err(CommandParseError::MissingValue("pset".into()))
        );
        assert!("pset abc".parse::<DeviceCommand>().is_err());
        assert_eq!("".parse::<DeviceCommand>(), Err(CommandParseError::Empty));
        assert_eq!(
            "warp 9".parse::<DeviceCommand>(),
            Err(CommandParseError::Unknown("warp".into()))
        );
    }

    #[test]
    fn test_command_ids_are_unique() {
        let a = CommandId::next();
        let b = CommandId::next();
        assert!(b > a);
    }
}
