//! UI-facing state surface: send phases, snapshots, change notifications.

use serde::Serialize;

use crate::core::ids::ConversationId;
use crate::core::message::ChatMessage;

/// Where the send pipeline currently is.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPhase {
    /// No send in flight; new sends are accepted.
    #[default]
    Idle,
    /// Waiting on the agent backend.
    Dispatching,
    /// Reply rendered; durable writes still settling.
    AwaitingPersistence,
    /// Dispatch failed; the engine settles back to idle right after.
    Failed,
}

impl SendPhase {
    /// Whether a send arriving now would be rejected.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Change notification broadcast to UI listeners.
///
/// Coarse by design: listeners re-read the engine snapshot when the revision
/// moves past what they last rendered.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EngineUpdate {
    /// The message list changed.
    Messages {
        /// State revision after the change.
        revision: u64,
    },
    /// The send pipeline moved to a new phase.
    Phase {
        /// State revision after the change.
        revision: u64,
        /// Phase entered.
        phase: SendPhase,
    },
    /// The active conversation changed.
    Conversation {
        /// State revision after the change.
        revision: u64,
        /// New active conversation, `None` for a fresh chat.
        conversation_id: Option<ConversationId>,
    },
    /// The active conversation's title changed.
    Title {
        /// State revision after the change.
        revision: u64,
        /// New title.
        title: String,
    },
}

impl EngineUpdate {
    /// Revision stamped on this update.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        match self {
            Self::Messages { revision }
            | Self::Phase { revision, .. }
            | Self::Conversation { revision, .. }
            | Self::Title { revision, .. } => *revision,
        }
    }
}

/// Point-in-time view of the engine, cheap to clone and render.
#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    /// Active conversation id, `None` while detached.
    pub conversation_id: Option<ConversationId>,
    /// Cached title, when this client has learned one.
    pub title: Option<String>,
    /// Messages in render order.
    pub messages: Vec<ChatMessage>,
    /// Send pipeline phase.
    pub phase: SendPhase,
    /// Last dispatch failure, cleared when the next send is accepted.
    pub last_error: Option<String>,
    /// Monotonic revision, bumped on every state change.
    pub revision: u64,
}
