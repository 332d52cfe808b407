//! Logical message identity for deduplication.
//!
//! The same logical message can reach the engine three times with three
//! different ids: the optimistic local copy, the persistence round-trip, and
//! the realtime push. The identity key is therefore derived from what the
//! message *is* (conversation, role, normalized content, coarse time bucket)
//! and never from any transport-assigned id.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::ConversationId;
use crate::core::message::{ChatMessage, ChatRole};

/// Scope token used when a message has no conversation id yet.
const DETACHED_SCOPE: &str = "detached";

/// Normalize content for keying (trim, lowercase, collapse whitespace).
#[must_use]
pub fn normalize_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut prev_space = false;

    for ch in text.trim().chars() {
        let is_space = ch.is_whitespace();
        if is_space {
            if !prev_space {
                normalized.push(' ');
                prev_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                normalized.push(lower);
            }
            prev_space = false;
        }
    }

    normalized
}

/// Compute a stable hex token for normalized content.
#[must_use]
pub fn compute_hash(normalized: &str) -> String {
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    let value = hasher.finish();
    format!("{value:016x}")
}

/// Stable dedup key of a logical message.
///
/// Equal for near-simultaneous copies of the same payload (clock skew between
/// the optimistic local timestamp and the server-confirmed one lands in the
/// same coarse bucket), distinct for the same text deliberately re-sent
/// minutes later.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Derive a key from message identity fields.
    ///
    /// `bucket_secs` sets the coarse time-bucket granularity and must be
    /// non-zero (enforced by config validation).
    #[must_use]
    pub fn derive(
        conversation_id: Option<ConversationId>,
        role: ChatRole,
        content_text: &str,
        created_at: DateTime<Utc>,
        bucket_secs: u64,
    ) -> Self {
        let scope = conversation_id.map_or_else(|| DETACHED_SCOPE.to_owned(), |id| id.to_string());
        let bucket = created_at.timestamp().div_euclid(bucket_secs.max(1) as i64);
        let content_hash = compute_hash(&normalize_text(content_text));
        Self(format!("{scope}:{}:{bucket}:{content_hash}", role.as_str()))
    }

    /// Derive the key of a message.
    #[must_use]
    pub fn of(message: &ChatMessage, bucket_secs: u64) -> Self {
        Self::derive(
            message.conversation_id,
            message.role,
            &message.content.storage_text(),
            message.created_at,
            bucket_secs,
        )
    }

    /// Borrow as `&str`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
