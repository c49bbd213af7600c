use serde::{Deserialize, Serialize};

/// A decoded device frame, classified by its tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundMessage {
    /// `r|KEY`: the device accepted the setting named KEY
    Ack { key: String },
    /// `v|NAME|VALUE`: a reported variable such as `PVBIN` (inlet pressure)
    Value {
        name: String,
        raw: String,
        /// Set when `raw` parses as a number
        value: Option<f64>,
    },
    /// `e|TEXT`: a device side fault
    DeviceError { message: String },
    Other { tag: String, params: Vec<String> },
}

impl InboundMessage {
    pub fn ack_key(&self) -> Option<&str> {
        match self {
            InboundMessage::Ack { key } => Some(key),
            _ => None,
        }
    }
}
