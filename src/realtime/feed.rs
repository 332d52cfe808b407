//! Change-feed interface for store-side row notifications.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ids::{ConversationId, ParticipantId};

/// Boxed future type for feed operations.
pub type FeedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error type for feed operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The feed rejected the subscription.
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// The connection to the feed was lost.
    #[error("feed connection lost: {0}")]
    Disconnected(String),
}

/// Result type for feed operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Table a change row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    /// Conversation metadata rows.
    Conversations,
    /// Message rows.
    Messages,
}

impl ChangeTable {
    /// Canonical table name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversations => "conversations",
            Self::Messages => "messages",
        }
    }
}

/// Kind of change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted; `row` holds what the store kept of the old record.
    Delete,
}

/// One change notification.
///
/// Delivery is at-least-once: the same row may arrive more than once and
/// consumers must deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Source table.
    pub table: ChangeTable,
    /// Kind of change.
    pub event: ChangeEvent,
    /// Row payload as the store serialized it.
    pub row: serde_json::Value,
}

/// Scope of changes a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Rows belonging to one conversation.
    Conversation(ConversationId),
    /// Message rows exchanged between two participants, either direction.
    ParticipantPair(ParticipantId, ParticipantId),
}

impl ChangeFilter {
    /// Stable channel name for this scope; pair order does not matter.
    #[must_use]
    pub fn channel_key(&self) -> String {
        match self {
            Self::Conversation(id) => format!("conversation:{id}"),
            Self::ParticipantPair(a, b) => {
                let mut pair = [a.to_string(), b.to_string()];
                pair.sort();
                format!("chat:{}-{}", pair[0], pair[1])
            }
        }
    }

    /// Whether a change row is in scope for this filter.
    #[must_use]
    pub fn matches(&self, change: &RowChange) -> bool {
        match self {
            Self::Conversation(id) => {
                let wanted = id.to_string();
                let field = match change.table {
                    ChangeTable::Conversations => "id",
                    ChangeTable::Messages => "conversation_id",
                };
                change
                    .row
                    .get(field)
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(|value| value == wanted)
            }
            Self::ParticipantPair(a, b) => {
                if change.table != ChangeTable::Messages {
                    return false;
                }
                let sender = change.row.get("sender_id").and_then(serde_json::Value::as_str);
                let receiver = change
                    .row
                    .get("receiver_id")
                    .and_then(serde_json::Value::as_str);
                let (Some(sender), Some(receiver)) = (sender, receiver) else {
                    return false;
                };
                let first = a.to_string();
                let second = b.to_string();
                (sender == first && receiver == second) || (sender == second && receiver == first)
            }
        }
    }
}

/// A live subscription. Canceling is idempotent; dropping cancels.
pub trait FeedSubscription: Send {
    /// Wait for the next in-scope change. Returns `None` once the
    /// subscription is canceled or the feed has closed.
    fn next_change(&mut self) -> FeedFuture<'_, Option<RowChange>>;

    /// Stop delivery. Safe to call more than once.
    fn cancel(&mut self);
}

/// Source of row-change notifications.
pub trait RealtimeFeed: Send + Sync {
    /// Open a subscription for changes matching `filter`.
    fn subscribe(
        &self,
        filter: ChangeFilter,
    ) -> FeedFuture<'_, RealtimeResult<Box<dyn FeedSubscription>>>;
}
