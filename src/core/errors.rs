//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::realtime::RealtimeError;
use crate::responder::ResponderError;

/// Result alias for engine operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Top-level error for engine operations.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A URL in the configuration failed to parse.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The outgoing message was empty after trimming.
    #[error("message is empty")]
    EmptyMessage,

    /// A send is already in flight.
    #[error("a send is already in flight")]
    SendInFlight,

    /// Identical payload re-sent within the cooldown window.
    #[error("duplicate send within cooldown")]
    DuplicateSend,

    /// The agent backend rejected or failed the dispatch.
    #[error(transparent)]
    Responder(#[from] ResponderError),

    /// The durable store failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The realtime feed failed.
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}
