pub mod config;
pub mod console;
pub mod delivery;
pub mod device;
pub mod schedule;
pub mod serial;
pub mod telemetry;
pub mod units;

pub use config::{ConfigError, ConsoleConfig, TimingConfig};
pub use console::{ConsoleBuilder, ConsoleError, ConsoleEvent, ConsoleHandle};
pub use delivery::{CommandId, DeliveryEvent, DeliveryMachine, DeviceCommand, MotorOptions};
pub use device::{LinkError, LinkManager};
pub use schedule::{BatchEvent, CommandBatch, Schedule, ScheduleStep, Sequencer, SequencerEvent};
pub use serial::{LinkEvent, LinkId, SerialLinkConfig, SerialTransport, Target};
