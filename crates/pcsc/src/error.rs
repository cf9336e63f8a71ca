//! Error types for the PC/SC lifecycle layer

use cardlink_core::{Error as CoreError, FailureKind};

/// Failures surfaced by the lifecycle layer or its provider.
///
/// The type is `Clone` so a single connect outcome can be fanned out to
/// every waiter that joined the same in-flight attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PcscError {
    /// The card was reset by the platform during an active transaction
    #[error("card was reset by the platform")]
    CardReset,

    /// The card was removed or is not present
    #[error("card removed or not present")]
    CardUnavailable,

    /// Another party holds exclusive or conflicting access
    #[error("card held exclusively by another party")]
    SharingViolation,

    /// The named terminal does not exist
    #[error("terminal not present: {0}")]
    UnknownTerminal(String),

    /// Operation attempted on a closed or invalid object
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A blocking wait gave up before the operation completed
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// Provider failure that maps onto no specific category, with the
    /// original provider error code preserved
    #[error("provider failure {code:#010x}: {message}")]
    Provider {
        /// Raw provider error code
        code: u32,
        /// Provider-supplied description
        message: String,
    },

    /// Failure from the protocol layer
    #[error(transparent)]
    Protocol(#[from] CoreError),
}

impl PcscError {
    /// Retry classification of this failure
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CardReset => FailureKind::Reset,
            Self::CardUnavailable | Self::UnknownTerminal(_) => FailureKind::Unavailable,
            Self::SharingViolation => FailureKind::Sharing,
            Self::InvalidState(_) => FailureKind::InvalidState,
            Self::Protocol(inner) => inner.kind(),
            Self::Timeout | Self::Cancelled | Self::Provider { .. } => FailureKind::Transport,
        }
    }
}

// The transmitter chain speaks the protocol layer's error type; provider
// failures cross into it without losing their retry classification.
impl From<PcscError> for CoreError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::Protocol(inner) => inner,
            other => Self::transport(other.kind(), other.to_string()),
        }
    }
}
