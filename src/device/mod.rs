pub mod manager;
pub mod models;

pub use manager::{LinkManager, DEFAULT_EVENT_CAPACITY};
pub use models::*;

use crate::serial::Target;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("No open link matches {0}")]
    NotConnected(Target),

    #[error("Link already open: {0}")]
    AlreadyOpen(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),

    #[error("Recording error: {0}")]
    RecordingError(#[from] crate::serial::RecordingError),
}

pub type Result<T> = std::result::Result<T, LinkError>;
