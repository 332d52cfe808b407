//! Wire rows exchanged with the REST store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::agents::AgentTag;
use crate::core::ids::{ConversationId, MessageId};
use crate::core::message::{ChatMessage, ChatRole, MessageContent, MessageOrigin};

/// Message row as the store returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    /// Store-assigned row id.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author role as stored.
    pub role: String,
    /// Raw stored content.
    pub content: String,
    /// Agent tag for assistant rows, absent otherwise.
    pub agent: Option<String>,
    /// Server-side creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl MessageRow {
    /// Convert a stored row into a domain message, classifying the content.
    ///
    /// Unknown roles map to [`ChatRole::Peer`] so rows written by other
    /// clients stay visible instead of being dropped.
    #[must_use]
    pub fn into_message(self) -> ChatMessage {
        let role = self.role.parse().unwrap_or(ChatRole::Peer);
        ChatMessage {
            id: MessageId::durable(self.id),
            conversation_id: Some(self.conversation_id),
            origin: MessageOrigin::Remote,
            role,
            content: MessageContent::parse(&self.content),
            agent: self.agent.as_deref().map(AgentTag::from_wire),
            created_at: self.created_at,
        }
    }
}

/// Insert payload for a message; the store assigns id and `created_at`.
#[derive(Debug, Clone, Serialize)]
pub struct NewMessageRow<'a> {
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author role.
    pub role: &'a str,
    /// Content in storage form (artifacts as their JSON envelope).
    pub content: String,
    /// Agent tag, stored as `null` for user rows.
    pub agent: Option<&'a str>,
}

impl<'a> NewMessageRow<'a> {
    /// Build an insert payload from a domain message.
    #[must_use]
    pub fn from_message(message: &'a ChatMessage, conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            role: message.role.as_str(),
            content: message.content.storage_text(),
            agent: message.agent.map(AgentTag::as_str),
        }
    }
}

/// Insert payload for a conversation; the store assigns the rest.
#[derive(Debug, Clone, Serialize)]
pub struct NewConversationRow<'a> {
    /// Initial display title.
    pub title: &'a str,
}

/// Patch payload for renaming a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct TitlePatch<'a> {
    /// New display title.
    pub title: &'a str,
    /// Renames count as activity.
    pub updated_at: DateTime<Utc>,
}

/// Patch payload for bumping a conversation's activity timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TouchPatch {
    /// New `updated_at` value.
    pub updated_at: DateTime<Utc>,
}

/// Minimal row used when only existence matters.
#[derive(Debug, Clone, Deserialize)]
pub struct IdRow {
    /// Store-assigned row id.
    pub id: String,
}
