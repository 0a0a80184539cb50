//! Error types for fimsync.
//!
//! All errors are strongly typed using thiserror. Storage and sequence
//! allocation failures surface to the caller of the change detector;
//! notification failures stay inside the dispatcher and logging failures
//! are swallowed by the log emitter.

use thiserror::Error;

pub use crate::dispatch::NotifyError;
pub use crate::logging::LogSinkError;
pub use crate::sequence::SequenceError;
pub use crate::storage::StorageError;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The identifier is the empty string.
    #[error("Entity identifier cannot be empty")]
    EmptyIdentifier,

    /// The identifier is longer than [`MAX_IDENTIFIER_LEN`](crate::entity::MAX_IDENTIFIER_LEN).
    #[error("Entity identifier exceeds maximum length of {max_length} bytes")]
    IdentifierTooLong {
        /// The limit in bytes.
        max_length: usize,
    },

    /// A configuration value is out of range or the document is malformed.
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for fimsync.
#[derive(Debug, Error)]
pub enum FimError {
    /// Rejected input or configuration.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The state store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No sequence id could be allocated.
    #[error("Sequence allocation error: {0}")]
    Sequence(#[from] SequenceError),

    /// Invariant violation or OS resource failure.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl FimError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a sequence allocation error.
    #[must_use]
    pub const fn is_sequence(&self) -> bool {
        matches!(self, Self::Sequence(_))
    }

    /// Returns true if retrying the same operation may succeed.
    ///
    /// I/O failures are transient from the caller's point of view; corrupted
    /// state and invalid input are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Storage(e) => matches!(e, StorageError::Io(_)),
            Self::Sequence(e) => matches!(e, SequenceError::Persist(_)),
        }
    }
}

/// Result type alias for fimsync operations.
pub type FimResult<T> = Result<T, FimError>;
