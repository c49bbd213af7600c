pub mod batch;
pub mod sequencer;
pub mod step;

pub use batch::{BatchEvent, BatchOutput, CommandBatch};
pub use sequencer::{Sequencer, SequencerEvent, SequencerOutput, SequencerState, SequencerTimings};
pub use step::{Schedule, ScheduleStep};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule has no steps")]
    Empty,

    #[error("A schedule is already running on this target")]
    AlreadyRunning,

    #[error("Invalid schedule step: {0}")]
    InvalidStep(String),

    #[error("Invalid schedule file: {0}")]
    InvalidFile(String),

    #[error("Command {0} is not acknowledged by the device and cannot be sequenced")]
    Unacknowledged(String),
}
