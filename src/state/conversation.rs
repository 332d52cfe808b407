//! Ordered, deduplicated message state for the active conversation.
//!
//! Messages arrive over three paths (optimistic local insert, durable store
//! reads, realtime change events) and each path may deliver the same logical
//! message more than once. All three converge through [`ConversationState::merge`],
//! which keeps the list ordered by `created_at` and collapses duplicates by
//! identity key rather than by transport id.

use std::collections::{HashMap, HashSet};

use crate::core::identity::IdentityKey;
use crate::core::ids::MessageId;
use crate::core::message::{ChatMessage, ChatRole, MessageOrigin};

/// Result of merging one message into the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The message was new and was inserted at its ordered position.
    Inserted,
    /// An existing provisional row adopted the incoming durable id.
    Promoted {
        /// The provisional id that was replaced.
        previous: MessageId,
    },
    /// The message was already present; nothing changed.
    Unchanged,
}

/// In-memory message list for the active conversation.
#[derive(Debug, Clone)]
pub struct ConversationState {
    bucket_secs: u64,
    messages: Vec<ChatMessage>,
    index: HashMap<IdentityKey, MessageId>,
    durable_seen: HashSet<MessageId>,
}

impl ConversationState {
    /// Create an empty state with the given identity-bucket granularity.
    #[must_use]
    pub fn new(bucket_secs: u64) -> Self {
        Self {
            bucket_secs,
            messages: Vec::new(),
            index: HashMap::new(),
            durable_seen: HashSet::new(),
        }
    }

    /// Messages in display order (`created_at` ascending, ties by insertion).
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the state holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether the state holds only locally generated assistant notices
    /// (the synthetic greeting or error notices), i.e. no real traffic yet.
    #[must_use]
    pub fn is_seed_only(&self) -> bool {
        self.messages
            .iter()
            .all(|m| m.origin == MessageOrigin::Local && m.role == ChatRole::Assistant)
    }

    /// Merge one message, deduplicating by identity key.
    ///
    /// A durable id that was already applied is a no-op regardless of how the
    /// row was keyed, which keeps at-least-once realtime delivery harmless.
    pub fn merge(&mut self, incoming: ChatMessage) -> MergeOutcome {
        if incoming.id.is_durable() && self.durable_seen.contains(&incoming.id) {
            return MergeOutcome::Unchanged;
        }

        let key = IdentityKey::of(&incoming, self.bucket_secs);
        if let Some(existing_id) = self.index.get(&key) {
            if existing_id.is_provisional() && incoming.id.is_durable() {
                let previous = existing_id.clone();
                if let Some(position) = self.position_of(&previous) {
                    self.messages[position].id = incoming.id.clone();
                    self.index.insert(key, incoming.id.clone());
                    self.durable_seen.insert(incoming.id);
                    return MergeOutcome::Promoted { previous };
                }
            }
            return MergeOutcome::Unchanged;
        }

        if incoming.id.is_durable() {
            self.durable_seen.insert(incoming.id.clone());
        }
        self.index.insert(key, incoming.id.clone());
        let position = self
            .messages
            .partition_point(|m| m.created_at <= incoming.created_at);
        self.messages.insert(position, incoming);
        MergeOutcome::Inserted
    }

    /// Swap a known provisional id for the durable row returned by the store.
    ///
    /// Used when the correspondence is certain (the caller inserted that exact
    /// row), so it does not depend on identity buckets lining up. Position and
    /// `created_at` of the existing entry are kept.
    pub fn promote(&mut self, provisional: &MessageId, durable: &ChatMessage) -> bool {
        if !durable.id.is_durable() {
            return false;
        }
        let Some(position) = self.position_of(provisional) else {
            return false;
        };
        let key = IdentityKey::of(&self.messages[position], self.bucket_secs);
        self.messages[position].id = durable.id.clone();
        self.index.insert(key, durable.id.clone());
        // Key the durable row's own bucket too, so a later realtime delivery
        // stamped with the server clock still lands on this entry.
        self.index
            .insert(IdentityKey::of(durable, self.bucket_secs), durable.id.clone());
        self.durable_seen.insert(durable.id.clone());
        true
    }

    /// Replace the whole state with a fresh message set.
    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        self.clear();
        for message in messages {
            let _ = self.merge(message);
        }
    }

    /// Drop every message and index entry.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
        self.durable_seen.clear();
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::core::agents::AgentTag;
    use crate::core::ids::ConversationId;
    use crate::core::message::MessageContent;

    const BUCKET: u64 = 60;

    fn message(role: ChatRole, text: &str, offset_secs: i64, durable: bool) -> ChatMessage {
        let id = if durable {
            MessageId::durable(format!("row-{role}-{text}"))
        } else {
            MessageId::provisional()
        };
        ChatMessage {
            id,
            conversation_id: Some(ConversationId::from_uuid(uuid::Uuid::from_u128(7))),
            origin: if durable {
                MessageOrigin::Remote
            } else {
                MessageOrigin::Local
            },
            role,
            content: MessageContent::Text(text.to_string()),
            agent: None,
            created_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_merge_orders_by_created_at() {
        let mut state = ConversationState::new(BUCKET);
        let later = message(ChatRole::Assistant, "second", 400, true);
        let earlier = message(ChatRole::User, "first", 0, true);
        assert_eq!(state.merge(later), MergeOutcome::Inserted);
        assert_eq!(state.merge(earlier), MergeOutcome::Inserted);

        let contents: Vec<String> = state
            .messages()
            .iter()
            .map(|m| m.content.storage_text())
            .collect();
        assert_eq!(contents, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_merge_equal_timestamps_keep_insertion_order() {
        let mut state = ConversationState::new(BUCKET);
        let one = message(ChatRole::User, "one", 0, true);
        let mut two = message(ChatRole::User, "two", 0, true);
        two.created_at = one.created_at;
        let mut three = message(ChatRole::User, "three", 0, true);
        three.created_at = one.created_at;
        let _ = state.merge(one);
        let _ = state.merge(two);
        let _ = state.merge(three);

        let contents: Vec<String> = state
            .messages()
            .iter()
            .map(|m| m.content.storage_text())
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut state = ConversationState::new(BUCKET);
        let row = message(ChatRole::User, "hello", 0, true);
        assert_eq!(state.merge(row.clone()), MergeOutcome::Inserted);
        assert_eq!(state.merge(row), MergeOutcome::Unchanged);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_merge_promotes_provisional_to_durable() {
        let mut state = ConversationState::new(BUCKET);
        let optimistic = message(ChatRole::User, "ship it", 0, false);
        let provisional_id = optimistic.id.clone();
        let mut durable = message(ChatRole::User, "ship it", 0, true);
        durable.created_at = optimistic.created_at;

        assert_eq!(state.merge(optimistic), MergeOutcome::Inserted);
        assert_eq!(
            state.merge(durable.clone()),
            MergeOutcome::Promoted {
                previous: provisional_id
            }
        );
        assert_eq!(state.len(), 1);
        assert_eq!(state.messages()[0].id, durable.id);
        // A redelivery of the same durable row is now a no-op.
        assert_eq!(state.merge(durable), MergeOutcome::Unchanged);
    }

    #[test]
    fn test_merge_permutations_converge() {
        let a = message(ChatRole::User, "a", 0, true);
        let b = message(ChatRole::Assistant, "b", 120, true);
        let c = message(ChatRole::User, "c", 240, true);

        let mut forward = ConversationState::new(BUCKET);
        for m in [a.clone(), b.clone(), c.clone()] {
            let _ = forward.merge(m);
        }
        let mut shuffled = ConversationState::new(BUCKET);
        for m in [c, a, b] {
            let _ = shuffled.merge(m);
        }

        let forward_ids: Vec<&str> = forward.messages().iter().map(|m| m.id.as_str()).collect();
        let shuffled_ids: Vec<&str> = shuffled.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(forward_ids, shuffled_ids);
    }

    #[test]
    fn test_promote_survives_server_clock_drift() {
        let mut state = ConversationState::new(BUCKET);
        let optimistic = message(ChatRole::User, "hello there", 0, false);
        let provisional_id = optimistic.id.clone();
        let mut durable = message(ChatRole::User, "hello there", 0, true);
        // Server stamped the row in a different identity bucket.
        durable.created_at = optimistic.created_at + Duration::seconds(3600);
        let displayed_at = optimistic.created_at;

        let _ = state.merge(optimistic);
        assert!(state.promote(&provisional_id, &durable));
        assert_eq!(state.len(), 1);
        assert_eq!(state.messages()[0].id, durable.id);
        assert_eq!(state.messages()[0].created_at, displayed_at);
        // Realtime redelivery of the durable row does not duplicate it.
        assert_eq!(state.merge(durable), MergeOutcome::Unchanged);
    }

    #[test]
    fn test_replace_all_resets_state() {
        let mut state = ConversationState::new(BUCKET);
        let _ = state.merge(message(ChatRole::User, "old", 0, true));
        state.replace_all(vec![
            message(ChatRole::User, "new one", 0, true),
            message(ChatRole::Assistant, "new two", 60, true),
        ]);
        assert_eq!(state.len(), 2);
        assert_eq!(state.messages()[0].content.storage_text(), "new one");
    }

    #[test]
    fn test_is_seed_only_tracks_local_notices() {
        let mut state = ConversationState::new(BUCKET);
        assert!(state.is_seed_only());

        let conversation = ConversationId::from_uuid(uuid::Uuid::from_u128(7));
        let _ = state.merge(ChatMessage::local_notice(
            Some(conversation),
            "Hello! How can I help?",
        ));
        assert!(state.is_seed_only());

        let mut user = message(ChatRole::User, "real traffic", 30, false);
        user.agent = Some(AgentTag::Cofounder);
        let _ = state.merge(user);
        assert!(!state.is_seed_only());
    }
}
