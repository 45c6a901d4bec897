use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Unified error type for sharded counter operations.
#[derive(Error, Debug, Clone)]
pub enum CounterError {
    /// Blank counter name or other malformed input, rejected before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Zero, oversized or overflowing increment/decrement amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// `create` on a counter that already exists, whatever its status
    #[error("Counter already exists: {0}")]
    AlreadyExists(String),

    /// Mutating a counter that was never created
    #[error("Counter not found: {0}")]
    NotFound(String),

    /// Mutating a counter that is being torn down
    #[error("Counter is being deleted: {0}")]
    CounterDeleting(String),

    /// The aggregate claimed a positive count but no shard could be decremented
    #[error(
        "No decrementable shard found for counter \"{counter}\" across {num_shards} shards"
    )]
    ConsistencyAnomaly { counter: String, num_shards: u32 },

    /// Optimistic single-key transaction kept losing races
    #[error("Transaction on {key} gave up after {attempts} conflicting attempts")]
    TransactionConflict { key: String, attempts: u32 },

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache service failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Job dispatch failure
    #[error("Queue error: {0}")]
    Queue(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Parse/serialization error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Validation error with messages
    #[error("Validation error: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    ValidationError(Vec<ValidationIssue>),
}

impl CounterError {
    /// Check if this error is transient and retryable
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CounterError::TransactionConflict { .. }
                | CounterError::Storage(_)
                | CounterError::Cache(_)
                | CounterError::Queue(_)
        )
    }

    /// Check if this error was caused by the caller rather than the backends
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CounterError::InvalidArgument(_)
                | CounterError::InvalidAmount(_)
                | CounterError::AlreadyExists(_)
                | CounterError::NotFound(_)
                | CounterError::CounterDeleting(_)
        )
    }
}

// === Conversion Implementations ===

macro_rules! impl_from_error {
    ($err_type:ty, $arm:pat => $body:expr) => {
        impl From<$err_type> for CounterError {
            fn from(err: $err_type) -> Self {
                match err {
                    $arm => $body,
                }
            }
        }
    };
}

impl_from_error!(std::io::Error, e => match e.kind() {
    std::io::ErrorKind::InvalidInput => CounterError::InvalidArgument(e.to_string()),
    _ => CounterError::IoError(e.to_string()),
});

impl_from_error!(serde_json::Error, e => CounterError::ParseError(e.to_string()));
impl_from_error!(toml::de::Error, e => CounterError::ParseError(e.to_string()));

/// Result type alias for operations that can fail with CounterError.
pub type CounterResult<T> = Result<T, CounterError>;
