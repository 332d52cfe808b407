//! Dispatch interface toward the agent backend.
//!
//! The backend exposes a single `POST /chat` endpoint: the client posts the
//! raw message text plus a thread id, and receives the reply text together
//! with the agent that produced it. [`Responder`] abstracts that exchange so
//! the engine can run against the HTTP backend or an in-process fake.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::agents::AgentTag;

/// Boxed future returned by [`Responder`] methods.
pub type DispatchFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result alias for responder operations.
pub type ResponderResult<T> = Result<T, ResponderError>;

/// Errors raised while dispatching to the agent backend.
#[derive(Debug, Error)]
pub enum ResponderError {
    /// The responder is missing configuration or misconfigured.
    #[error("responder configuration: {0}")]
    Config(String),

    /// No reply arrived within the dispatch deadline.
    #[error("request timed out")]
    Timeout,

    /// The backend could not be reached at all.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with a non-success status.
    #[error("server error: {status} - {body}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The reply arrived but carried no usable text.
    #[error("{0}")]
    InvalidReply(String),
}

impl ResponderError {
    /// Text shown in the conversation when a dispatch fails.
    #[must_use]
    pub fn notice_text(&self) -> String {
        match self {
            Self::Timeout => "The request timed out. Please try again.".to_string(),
            Self::Unreachable(_) | Self::Config(_) => {
                "Could not reach the server. Please check your connection and try again."
                    .to_string()
            }
            Self::Remote { status, body } => format!("Server error: {status} - {body}"),
            Self::InvalidReply(reason) => reason.clone(),
        }
    }
}

/// Outgoing dispatch payload.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    /// Raw message text, untrimmed.
    pub message: String,
    /// Thread the backend should continue. The backend mints one when
    /// absent; the engine always fills it with the conversation id or a
    /// locally minted fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Routing override; the backend picks an agent when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentTag>,
}

/// Reply payload from the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponderReply {
    /// Reply text. Defaults to empty so a missing or `null` field falls into
    /// the same emptiness check as `""`.
    #[serde(default)]
    pub response: String,
    /// Agent that produced the reply, as the wire spells it.
    pub agent: Option<String>,
    /// Thread id echoed or minted by the backend. Unused by the engine.
    pub thread_id: Option<String>,
}

/// Dispatches a message and awaits the agent's reply.
pub trait Responder: Send + Sync {
    /// Send `request` to the backend and wait for the reply.
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> DispatchFuture<'_, ResponderResult<ResponderReply>>;
}
