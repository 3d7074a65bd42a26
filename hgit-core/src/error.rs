//! Error taxonomy for the synchronization engine.
//!
//! Everything that can corrupt the bijection or produce a tree that does not
//! match its content hash is fatal. Only `RefConflict` is reported per ref and
//! lets the remaining ref updates proceed.

use crate::storage::StorageError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the synchronization engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Duplicate or contradictory map entry, or a missing parent object.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Malformed or unexpected peer response during negotiation.
    #[error("Protocol error: {0} (the transfer keeps no partial state, please retry)")]
    Protocol(String),

    /// Non-fast-forward ref update without force.
    #[error("Ref conflict on {ref_name}: {reason}")]
    RefConflict { ref_name: String, reason: String },

    /// A ref name resolved to more than one candidate.
    #[error("Ambiguous ref '{name}': matches {}", candidates.join(", "))]
    Authority { name: String, candidates: Vec<String> },

    /// The transport failed mid-transfer; the whole sync is aborted.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An object or metadata record could not be parsed.
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// The caller cancelled the run before it completed.
    #[error("Sync cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this error aborts the whole sync.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::RefConflict { .. })
    }

    pub(crate) fn consistency(msg: impl Into<String>) -> Self {
        SyncError::Consistency(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        SyncError::Protocol(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        SyncError::Malformed(msg.into())
    }
}

impl From<hex::FromHexError> for SyncError {
    fn from(e: hex::FromHexError) -> Self {
        SyncError::Malformed(format!("invalid hex: {}", e))
    }
}
