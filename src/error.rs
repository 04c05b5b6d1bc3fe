//! Error types shared across the messaging core.
//!
//! Transport and routing failures are split along the retry boundary: a
//! [`JoynrError::DelayMessage`] is transient and may be rescheduled, everything
//! else is terminal for the operation that produced it. Errors are `Clone` so
//! a single failure can be fanned out to every queued send callback.

use thiserror::Error;

/// Errors surfaced by the messaging core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoynrError {
    /// Transient failure; the message may be rescheduled and retried.
    #[error("{0}")]
    DelayMessage(String),

    /// Unrecoverable transport failure; the connection is dead.
    #[error("fatal transport error: {0}")]
    FatalTransport(String),

    /// Recoverable transport failure (connect refused, peer gone).
    #[error("transport error: {0}")]
    Transport(String),

    /// The message TTL elapsed before delivery.
    #[error("message expired: {0}")]
    Expired(String),

    /// Caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Subscription-time validation failure (unknown attribute, bad QoS).
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Settings could not be loaded or persisted.
    #[error("settings error: {0}")]
    Settings(String),

    /// Persistence backend failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Message envelope could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JoynrError {
    /// Whether the router may reschedule the message and try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, JoynrError::DelayMessage(_) | JoynrError::Transport(_))
    }
}

/// One-shot failure callback attached to a send.
///
/// Invoked at most once; success paths never call it.
pub type FailureCallback = Box<dyn FnOnce(JoynrError) + Send>;
