use thiserror::Error;

/// Errors that can occur while talking to the primary or fallback backends.
///
/// Component boundaries convert these into `Option`/`bool` results plus a log
/// entry; the `try_*` variants of each component expose them to callers that
/// need to tell a failure apart from a legitimate miss.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The primary backend is unreachable.
    #[error("Backend unreachable: {0}")]
    Connectivity(String),
    /// A stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The fallback store's byte budget would be exceeded.
    #[error("Fallback memory ceiling exceeded: {requested} bytes requested, {available} available")]
    Capacity { requested: usize, available: usize },
    /// A single operation exceeded its time budget.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
    /// Invalid configuration detected at construction time.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// The backend rejected or failed the operation.
    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl KvError {
    /// Returns true if the error means the backend itself is gone, as opposed
    /// to a single failed call.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, KvError::Connectivity(_))
    }

    /// Shorthand for a timeout on the named operation.
    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        KvError::Timeout {
            operation: operation.into(),
            after_ms,
        }
    }
}

impl From<serde_json::Error> for KvError {
    fn from(err: serde_json::Error) -> Self {
        KvError::Serialization(err.to_string())
    }
}

/// Result type for substrate operations.
pub type Result<T> = std::result::Result<T, KvError>;
