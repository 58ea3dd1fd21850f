use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the logical connection to the primary backend.
///
/// Only the connection manager mutates this; everyone else reads snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connected: bool,
    pub connecting: bool,
    pub last_error: Option<String>,
    /// Failed connect attempts since the last successful connect.
    pub attempt_count: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_reconnect_at: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// Records a successful connect at `now`.
    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.connected = true;
        self.connecting = false;
        self.attempt_count = 0;
        self.last_error = None;
        self.last_connected_at = Some(now);
    }

    /// Records a failed connect attempt.
    pub fn mark_attempt_failed(&mut self, error: impl Into<String>) {
        self.connected = false;
        self.connecting = false;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.into());
    }

    /// Records that an established connection was lost.
    pub fn mark_disconnected(&mut self, error: impl Into<String>) {
        self.connected = false;
        self.last_error = Some(error.into());
    }
}

/// Result of a connection health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ConnectionHealth {
    pub fn up(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}
