//! Error types for protocol-level operations

/// Categories a failure falls into for retry classification.
///
/// Provider-level error codes collapse onto these five kinds; the
/// [`RetryPolicy`](crate::retry::RetryPolicy) only ever looks at the kind,
/// never at the original code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The card was reset by the platform, typically during an active
    /// transaction. Always transient.
    Reset,
    /// The card was removed or is not present. Never transient.
    Unavailable,
    /// Another party holds exclusive or conflicting access.
    Sharing,
    /// Operation attempted on an already-closed or invalid object.
    InvalidState,
    /// Malformed response or generic provider failure.
    Transport,
}

/// Errors produced by the protocol layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Command buffer too short or with inconsistent length fields
    #[error("invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Response buffer shorter than the two status word bytes
    #[error("response too short: {0} bytes")]
    ResponseTooShort(usize),

    /// Malformed Answer-To-Reset
    #[error("invalid ATR: {0}")]
    Atr(&'static str),

    /// A transmitter observed something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Failure reported by the underlying transport
    #[error("transport failure ({kind:?}): {message}")]
    Transport {
        /// Retry classification of the failure
        kind: FailureKind,
        /// Human-readable description from the transport
        message: String,
    },
}

impl Error {
    /// Create a transport failure with an explicit retry classification
    pub fn transport(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Retry classification of this error
    ///
    /// Protocol-level errors (bad lengths, malformed responses) are
    /// transport failures for retry purposes: the transport layer itself
    /// never retries them.
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Transport { kind, .. } => *kind,
            _ => FailureKind::Transport,
        }
    }
}
