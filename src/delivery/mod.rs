pub mod command;
pub mod machine;
pub mod options;
pub mod timer;

pub use command::{CommandId, CommandParseError, DeviceCommand};
pub use machine::{DeliveryEvent, DeliveryMachine, DeliveryState, DeliveryTimings};
pub use options::MotorOptions;
pub use timer::Timer;
