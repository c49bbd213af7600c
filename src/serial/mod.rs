pub mod binary;
pub mod config;
pub mod interface;
pub mod loopback;
pub mod protocol;
pub mod recording;

pub use binary::{BinaryFrameDecoder, BinaryRecord, RecordValidity};
pub use config::{DataBits, FlowControl, LineEnding, Parity, ReadMode, SerialLinkConfig, StopBits};
pub use interface::{discover_ports, LinkEvent, LinkReader, LinkStats, LinkWriter, SerialTransport};
pub use loopback::{loopback_pair, open_loopback, LoopbackDevice};
pub use recording::{Recorder, RecordingError};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Information about a serial port found during discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Identity of one open link. Events carry it so consumers can filter a
/// shared event stream by port and baud rate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId {
    pub port: String,
    pub baud: u32,
}

impl LinkId {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self { port: port.into(), baud }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.port, self.baud)
    }
}

/// Logical destination for link operations and commands
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Every open link
    All,
    /// One link, by port name
    Port(String),
}

impl Target {
    pub fn port(name: impl Into<String>) -> Self {
        Target::Port(name.into())
    }

    /// Port names compare case-insensitively ("com3" addresses "COM3").
    pub fn matches_port(&self, port: &str) -> bool {
        match self {
            Target::All => true,
            Target::Port(name) => name.eq_ignore_ascii_case(port),
        }
    }

    pub fn matches(&self, link: &LinkId) -> bool {
        self.matches_port(&link.port)
    }

    /// Upper-cased form, so spellings that address the same link compare
    /// and hash equal
    pub fn canonical(&self) -> Target {
        match self {
            Target::All => Target::All,
            Target::Port(name) => Target::Port(name.to_ascii_uppercase()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("ALL"),
            Target::Port(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Target {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case("all") {
            Target::All
        } else {
            Target::Port(value.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid link configuration: {0}")]
    InvalidConfig(String),

    #[error("Link already open: {0}")]
    AlreadyOpen(String),

    #[error("Link closed")]
    Closed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
