//! Crate error types.

use thiserror::Error;

use crate::classifier::ErrorClassification;
use crate::manager::ConnectionState;
use crate::resolver::ResolutionFailure;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors surfaced by the session layer.
///
/// Upstream failures never appear here raw: they are classified first and
/// carried as [`ErrorClassification`] values.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Every resolution strategy was exhausted.
    #[error("{}", .0.classification.user_message)]
    Resolution(Box<ResolutionFailure>),

    /// A classified upstream failure.
    #[error("{}", .0.user_message)]
    Classified(ErrorClassification),

    /// A `connect()` call was refused because the previous session is blocked.
    #[error("connect rejected: {reason}")]
    ConnectRejected {
        reason: String,
        classification: ErrorClassification,
    },

    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The classification attached to this error, if any.
    pub fn classification(&self) -> Option<&ErrorClassification> {
        match self {
            Self::Resolution(failure) => Some(&failure.classification),
            Self::Classified(classification) => Some(classification),
            Self::ConnectRejected { classification, .. } => Some(classification),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ResolutionFailure> for LinkError {
    fn from(failure: ResolutionFailure) -> Self {
        Self::Resolution(Box::new(failure))
    }
}
