use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serial::{LinkId, LinkStats};

/// Link connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Snapshot of one known link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub link: LinkId,
    pub connection_state: ConnectionState,
    pub paused: bool,
    pub recording: Option<PathBuf>,
    pub stats: LinkStats,
    pub last_seen: DateTime<Utc>,
}

impl LinkInfo {
    pub fn new(link: LinkId, connection_state: ConnectionState) -> Self {
        Self {
            link,
            connection_state,
            paused: false,
            recording: None,
            stats: LinkStats::default(),
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }
}
