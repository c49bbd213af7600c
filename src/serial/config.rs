//! Link configuration as entered in the connection dialog
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{LinkId, Result, SerialError};

pub const MIN_BAUD_RATE: u32 = 300;
pub const MAX_BAUD_RATE: u32 = 2_000_000;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Longest read timeout a link accepts, in seconds
pub const MAX_TIMEOUT_SECS: f64 = 3600.0;

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    XonXoff,
    RtsCts,
    DsrDtr,
}

/// What gets appended to terminal-style text writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    None,
    Cr,
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

/// Framing strategy used by the read loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadMode {
    /// Bytes up to and including `\n`, or whatever arrived before the timeout
    #[default]
    Line,
    /// Up to `count` bytes per read
    Bytes { count: usize },
    /// Bytes up to and including `delimiter`
    Until { delimiter: u8 },
    /// `AA 55` framed records with CRC-16/Modbus
    BinaryDevice,
    /// Every byte is appended to the raw log file
    RawLog,
}

impl ReadMode {
    pub fn is_binary(&self) -> bool {
        matches!(self, ReadMode::BinaryDevice)
    }
}

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_secs() -> f64 {
    1.0
}

fn default_max_signal_rate() -> u32 {
    10
}

fn default_raw_log_path() -> PathBuf {
    PathBuf::from("raw-log.txt")
}

/// Serial link parameters. A transport copies this on open; changing a
/// link's settings means closing it and opening a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialLinkConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub data_bits: DataBits,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub stop_bits: StopBits,
    #[serde(default)]
    pub flow_control: FlowControl,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub local_echo: bool,
    #[serde(default)]
    pub line_ending: LineEnding,
    #[serde(default)]
    pub read_mode: ReadMode,
    #[serde(default)]
    pub dtr: bool,
    /// Upper bound on emitted binary records per channel-count header, in Hz
    #[serde(default = "default_max_signal_rate")]
    pub max_signal_rate: u32,
    #[serde(default = "default_raw_log_path")]
    pub raw_log_path: PathBuf,
}

impl SerialLinkConfig {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            timeout_secs: default_timeout_secs(),
            local_echo: false,
            line_ending: LineEnding::default(),
            read_mode: ReadMode::default(),
            dtr: false,
            max_signal_rate: default_max_signal_rate(),
            raw_log_path: default_raw_log_path(),
        }
    }

    pub fn with_read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn link_id(&self) -> LinkId {
        LinkId::new(self.port.clone(), self.baud)
    }

    /// Read timeout, capped at [`MAX_TIMEOUT_SECS`]
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs.is_nan() || self.timeout_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.timeout_secs.min(MAX_TIMEOUT_SECS))
    }

    /// Check the values a connection dialog can get wrong
    pub fn validate(&self) -> Result<()> {
        if self.port.trim().is_empty() {
            return Err(SerialError::InvalidConfig("port name is empty".into()));
        }
        if !(MIN_BAUD_RATE..=MAX_BAUD_RATE).contains(&self.baud) {
            return Err(SerialError::InvalidConfig(format!(
                "baud rate {} outside {}..={}",
                self.baud, MIN_BAUD_RATE, MAX_BAUD_RATE
            )));
        }
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(SerialError::InvalidConfig(format!(
                "timeout {} s must be in (0, {}]",
                self.timeout_secs, MAX_TIMEOUT_SECS
            )));
        }
        if let ReadMode::Bytes { count: 0 } = self.read_mode {
            return Err(SerialError::InvalidConfig("read byte count must be at least 1".into()));
        }
        if self.max_signal_rate == 0 {
            return Err(SerialError::InvalidConfig("max signal rate must be at least 1 Hz".into()));
        }
        Ok(())
    }

    /// Translate into a `serialport` builder. Settings the OS backend cannot
    /// express are rejected rather than silently approximated.
    pub fn port_builder(&self) -> Result<serialport::SerialPortBuilder> {
        self.validate()?;

        let data_bits = match self.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let parity = match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(SerialError::InvalidConfig(format!(
                    "{:?} parity is not supported by the serial backend",
                    self.parity
                )))
            }
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(SerialError::InvalidConfig(
                    "1.5 stop bits are not supported by the serial backend".into(),
                ))
            }
        };
        let flow_control = match self.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::XonXoff => serialport::FlowControl::Software,
            FlowControl::RtsCts => serialport::FlowControl::Hardware,
            FlowControl::DsrDtr => {
                return Err(SerialError::InvalidConfig(
                    "DSR/DTR flow control is not supported by the serial backend".into(),
                ))
            }
        };

        Ok(serialport::new(self.port.clone(), self.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(self.timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_out_of_range_baud() {
        let config = SerialLinkConfig::new("COM1", 100);
        assert!(matches!(config.validate(), Err(SerialError::InvalidConfig(_))));

        let config = SerialLinkConfig::new("COM1", 2_000_001);
        assert!(config.validate().is_err());

        let config = SerialLinkConfig::new("COM1", 115200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_port_and_zero_reads() {
        assert!(SerialLinkConfig::new("  ", 9600).validate().is_err());

        let config = SerialLinkConfig::new("COM1", 9600).with_read_mode(ReadMode::Bytes { count: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_is_bounded() {
        let mut config = SerialLinkConfig::new("COM1", 9600);
        config.timeout_secs = 1e20;
        assert!(config.validate().is_err());
        assert_eq!(config.timeout(), Duration::from_secs(3600));

        config.timeout_secs = MAX_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
        config.timeout_secs = f64::NAN;
        assert!(config.validate().is_err());
        assert_eq!(config.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_unsupported_settings_are_rejected_by_builder() {
        let mut config = SerialLinkConfig::new("COM1", 9600);
        config.stop_bits = StopBits::OnePointFive;
        assert!(config.port_builder().is_err());

        let mut config = SerialLinkConfig::new("COM1", 9600);
        config.parity = Parity::Mark;
        assert!(config.port_builder().is_err());

        let mut config = SerialLinkConfig::new("COM1", 9600);
        config.flow_control = FlowControl::RtsCts;
        assert!(config.port_builder().is_ok());
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: SerialLinkConfig = toml::from_str(
            r#"
            port = "/dev/ttyUSB0"
            read_mode = { kind = "until", delimiter = 62 }
            stop_bits = "2"
            "#,
        )
        .expect("parse");
        assert_eq!(config.baud, DEFAULT_BAUD_RATE);
        assert_eq!(config.stop_bits, StopBits::Two);
        assert_eq!(config.read_mode, ReadMode::Until { delimiter: b'>' });
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.max_signal_rate, 10);
    }

    #[test]
    fn test_line_ending_bytes() {
        assert_eq!(LineEnding::CrLf.as_bytes(), b"\r\n");
        assert!(LineEnding::None.as_bytes().is_empty());
    }
}
