//! Core error types for the curation engine.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid identifier (rule id, table name, dataset name)
    InvalidId {
        /// What kind of identifier was rejected
        kind: String,
        /// Why it was rejected
        reason: String,
    },

    /// Unknown data stage name
    UnknownStage {
        /// The name that failed to parse
        name: String,
    },

    /// A value failed validation
    Validation {
        /// Field that was rejected
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Referenced item does not exist
    NotFound {
        /// Kind of item
        kind: String,
        /// Its identifier
        id: String,
    },

    /// Item was added twice
    AlreadyExists {
        /// Kind of item
        kind: String,
        /// Its identifier
        id: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { kind, reason } => write!(f, "Invalid {}: {}", kind, reason),
            Self::UnknownStage { name } => write!(f, "Unknown data stage: {}", name),
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
        }
    }
}

impl std::error::Error for CoreError {}
