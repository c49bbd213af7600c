use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::delivery::{CommandId, DeliveryEvent, DeliveryState, DeviceCommand};
use crate::device::LinkError;
use crate::schedule::{BatchEvent, ScheduleError, ScheduleStep, SequencerEvent, SequencerState};
use crate::serial::{LinkEvent, LinkId, Target};
use crate::telemetry::InboundMessage;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Console task is not running")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

/// Requests handled by the control task
#[derive(Debug)]
pub enum ConsoleRequest {
    /// Acknowledged commands answer with their ticket; fire-and-forget
    /// commands are written at once and answer `None`
    Send {
        target: Target,
        command: DeviceCommand,
        responder: oneshot::Sender<Result<Option<CommandId>>>,
    },
    StartSchedule {
        target: Target,
        steps: Vec<ScheduleStep>,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Answers whether a schedule was running
    StopSchedule {
        target: Target,
        reset: bool,
        responder: oneshot::Sender<bool>,
    },
    /// Send acknowledged commands one at a time, each after the previous
    /// ack
    StartBatch {
        target: Target,
        commands: Vec<DeviceCommand>,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Answers whether a batch was running
    StopBatch {
        target: Target,
        responder: oneshot::Sender<bool>,
    },
    Status {
        responder: oneshot::Sender<Vec<TargetStatus>>,
    },
    Shutdown,
}

/// Everything the control task publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "payload", rename_all = "snake_case")]
pub enum ConsoleEvent {
    Link(LinkEvent),
    Delivery(DeliveryEvent),
    Sequencer(SequencerEvent),
    Batch(BatchEvent),
    Telemetry { link: LinkId, message: InboundMessage },
}

/// Delivery and schedule state of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub target: Target,
    pub delivery: DeliveryState,
    pub in_flight: Option<CommandId>,
    pub queued: Option<CommandId>,
    pub sequencer: SequencerState,
    /// 1-based current step, 0 before the first start
    pub step: usize,
    pub progress: Vec<u8>,
    pub batch_running: bool,
}
