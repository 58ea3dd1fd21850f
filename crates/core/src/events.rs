use serde::{Deserialize, Serialize};

/// Discrete transitions of the primary backend and the fallback coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BackendEvent {
    Connected,
    Disconnected { reason: String },
    FallbackActivated { reason: String },
    /// Queued writes were replayed against the primary.
    Reconciled { replayed: usize },
}

impl BackendEvent {
    /// Event name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            BackendEvent::Connected => "redis:connected",
            BackendEvent::Disconnected { .. } => "redis:disconnected",
            BackendEvent::FallbackActivated { .. } => "fallback:activated",
            BackendEvent::Reconciled { .. } => "fallback:reconciled",
        }
    }
}
