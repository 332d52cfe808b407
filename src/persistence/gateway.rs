//! Durable store interface for conversations and messages.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::ConversationId;
use crate::core::message::{ChatMessage, ChatRole};

/// Boxed future type for gateway operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type for gateway operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The gateway was configured with unusable settings.
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// The conversation does not exist in the store.
    #[error("conversation {0} not found")]
    NotFound(ConversationId),

    /// The message carries no conversation id and cannot be persisted.
    #[error("message is not attached to a conversation")]
    Detached,

    /// Transport-level failure reaching the store.
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with a non-success status.
    #[error("store returned HTTP {status}: {body}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Response body, best effort.
        body: String,
    },

    /// The store's reply could not be decoded.
    #[error("store reply could not be decoded: {0}")]
    InvalidResponse(String),
}

/// Result type for gateway operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// A conversation record as the store holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Store-assigned identifier.
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// Last activity timestamp, drives list ordering.
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for conversations and their messages.
///
/// Implementations must be safe to call concurrently; the engine issues
/// fire-and-forget persistence from spawned tasks.
pub trait PersistenceGateway: Send + Sync {
    /// Create a conversation titled `title` and return its id.
    fn create_conversation(
        &self,
        title: &str,
    ) -> StoreFuture<'_, PersistenceResult<ConversationId>>;

    /// Update the title of a conversation.
    fn rename_conversation(
        &self,
        id: ConversationId,
        title: &str,
    ) -> StoreFuture<'_, PersistenceResult<()>>;

    /// List conversations ordered by `updated_at` DESC, newest first.
    fn list_conversations(
        &self,
        limit: usize,
    ) -> StoreFuture<'_, PersistenceResult<Vec<Conversation>>>;

    /// Delete a conversation together with its messages.
    fn delete_conversation(&self, id: ConversationId) -> StoreFuture<'_, PersistenceResult<()>>;

    /// Load every message of a conversation ordered by `created_at` ASC.
    ///
    /// Returns [`PersistenceError::NotFound`] when the conversation does not
    /// exist, as opposed to an empty list for an existing one.
    fn load_messages(
        &self,
        id: ConversationId,
    ) -> StoreFuture<'_, PersistenceResult<Vec<ChatMessage>>>;

    /// Whether a message with this role and exact stored content already
    /// exists in the conversation at or after `since`.
    fn message_exists(
        &self,
        id: ConversationId,
        role: ChatRole,
        content: &str,
        since: DateTime<Utc>,
    ) -> StoreFuture<'_, PersistenceResult<bool>>;

    /// Insert a message and return the stored row, carrying the durable id
    /// and server timestamps.
    fn insert_message(
        &self,
        message: &ChatMessage,
    ) -> StoreFuture<'_, PersistenceResult<ChatMessage>>;
}
