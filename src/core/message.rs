//! Message model for conversation state.
//!
//! Content is classified **once**, when a message enters the engine (user
//! input, responder reply, history row, realtime row). Structured canvas
//! payloads that the backend embeds as JSON envelopes become
//! [`MessageContent::StructuredArtifact`] here instead of being re-sniffed by
//! every renderer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::agents::AgentTag;
use crate::core::ids::{ConversationId, MessageId};

/// Role of a message within a conversation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Local user input.
    User,
    /// Agent backend reply.
    Assistant,
    /// Message from the other participant in a peer chat.
    Peer,
}

impl ChatRole {
    /// Stable string form for storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Peer => "peer",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChatRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "peer" => Ok(Self::Peer),
            _ => Err(value.to_string()),
        }
    }
}

/// Where a message copy entered the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Created by this client (optimistic insert or injected notice).
    Local,
    /// Arrived from the responder, the store, or the realtime feed.
    Remote,
}

/// Kind of a structured artifact embedded in message content.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Lean canvas grid.
    LeanCanvas,
    /// Business model canvas grid.
    BusinessModelCanvas,
}

impl ArtifactKind {
    /// Stable identifier matching the envelope `type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeanCanvas => "lean_canvas",
            Self::BusinessModelCanvas => "business_model_canvas",
        }
    }

    fn from_type_field(value: &str) -> Option<Self> {
        match value {
            "lean_canvas" => Some(Self::LeanCanvas),
            "business_model_canvas" => Some(Self::BusinessModelCanvas),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message content, classified at the ingestion boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Structured canvas envelope the renderer draws as a grid.
    StructuredArtifact {
        /// Which canvas family the payload belongs to.
        kind: ArtifactKind,
        /// Full JSON envelope as stored on the wire.
        payload: serde_json::Value,
    },
}

impl MessageContent {
    /// Classify raw wire/user content.
    ///
    /// An artifact is a JSON object whose `type` names a known
    /// [`ArtifactKind`] and that carries a `data` object; anything else is
    /// plain text.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with('{')
            && let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
            && let Some(kind) = value
                .get("type")
                .and_then(serde_json::Value::as_str)
                .and_then(ArtifactKind::from_type_field)
            && value.get("data").is_some_and(serde_json::Value::is_object)
        {
            return Self::StructuredArtifact {
                kind,
                payload: value,
            };
        }

        Self::Text(raw.to_owned())
    }

    /// Wire/storage text form.
    ///
    /// Artifacts re-serialize to their compact JSON envelope, so a row
    /// written by this client classifies identically on any other client.
    #[must_use]
    pub fn storage_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::StructuredArtifact { payload, .. } => payload.to_string(),
        }
    }

    /// True for plain text content.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

/// A single message as held in conversation state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Provisional or durable identifier.
    pub id: MessageId,
    /// Owning conversation; `None` while sending detached (creation failed).
    pub conversation_id: Option<ConversationId>,
    /// Which side of the engine produced this copy.
    pub origin: MessageOrigin,
    /// Role of the author.
    pub role: ChatRole,
    /// Classified content.
    pub content: MessageContent,
    /// Agent tag for assistant messages.
    pub agent: Option<AgentTag>,
    /// Creation timestamp used for ordering.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build an optimistic local user message.
    #[must_use]
    pub fn user(conversation_id: Option<ConversationId>, raw: &str) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            origin: MessageOrigin::Local,
            role: ChatRole::User,
            content: MessageContent::parse(raw),
            agent: None,
            created_at: Utc::now(),
        }
    }

    /// Build an assistant message from a responder reply.
    #[must_use]
    pub fn assistant(conversation_id: Option<ConversationId>, agent: AgentTag, raw: &str) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            origin: MessageOrigin::Remote,
            role: ChatRole::Assistant,
            content: MessageContent::parse(raw),
            agent: Some(agent),
            created_at: Utc::now(),
        }
    }

    /// Build a locally injected supervisor notice (greeting, error text).
    ///
    /// Notices render like assistant messages but are never persisted.
    #[must_use]
    pub fn local_notice(conversation_id: Option<ConversationId>, text: &str) -> Self {
        Self {
            id: MessageId::provisional(),
            conversation_id,
            origin: MessageOrigin::Local,
            role: ChatRole::Assistant,
            content: MessageContent::Text(text.to_owned()),
            agent: Some(AgentTag::Supervisor),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_stays_text() {
        let content = MessageContent::parse("hello there");
        assert_eq!(content, MessageContent::Text("hello there".to_owned()));
        assert!(content.is_text());
    }

    #[test]
    fn test_canvas_envelope_classifies_as_artifact() {
        let raw = r#"{"type":"lean_canvas","data":{"problem":"x"}}"#;
        let content = MessageContent::parse(raw);
        assert!(matches!(
            content,
            MessageContent::StructuredArtifact {
                kind: ArtifactKind::LeanCanvas,
                ..
            }
        ));
        assert!(content.storage_text().contains("\"problem\""));
    }

    #[test]
    fn test_unknown_envelope_stays_text() {
        let raw = r#"{"type":"swot_matrix","data":{}}"#;
        assert!(MessageContent::parse(raw).is_text());
        // Known type without a data object is also plain text.
        let raw = r#"{"type":"lean_canvas"}"#;
        assert!(MessageContent::parse(raw).is_text());
    }

    #[test]
    fn test_artifact_storage_text_reclassifies() {
        let raw = r#"{"type":"business_model_canvas","data":{"channels":[]}}"#;
        let content = MessageContent::parse(raw);
        let stored = content.storage_text();
        assert_eq!(MessageContent::parse(&stored), content);
    }

    #[test]
    fn test_constructors_set_roles() {
        let user = ChatMessage::user(None, "hi");
        assert_eq!(user.role, ChatRole::User);
        assert_eq!(user.origin, MessageOrigin::Local);
        assert!(user.id.is_provisional());
        assert!(user.agent.is_none());

        let reply = ChatMessage::assistant(None, AgentTag::Cofounder, "hello");
        assert_eq!(reply.role, ChatRole::Assistant);
        assert_eq!(reply.origin, MessageOrigin::Remote);
        assert_eq!(reply.agent, Some(AgentTag::Cofounder));

        let notice = ChatMessage::local_notice(None, "welcome");
        assert_eq!(notice.agent, Some(AgentTag::Supervisor));
        assert_eq!(notice.origin, MessageOrigin::Local);
    }
}
