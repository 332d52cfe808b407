//! Bookkeeping for optimistic messages that are not yet durable.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::identity::IdentityKey;
use crate::core::ids::MessageId;

/// One in-flight optimistic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Identity key of the optimistic message.
    pub identity_key: IdentityKey,
    /// Provisional id the row carries until the store confirms it.
    pub provisional_id: MessageId,
    /// When the message was handed to the send pipeline.
    pub dispatched_at: DateTime<Utc>,
    /// How many times this identity has been dispatched.
    pub attempt: u32,
}

/// Tracks optimistic messages awaiting durable confirmation.
///
/// Entries are resolved when the store echoes the row back (directly or over
/// the realtime feed) and reclaimed when they outlive the request timeout, so
/// an interrupted send never blocks the identity forever.
#[derive(Debug, Clone, Default)]
pub struct PendingStore {
    entries: HashMap<IdentityKey, PendingEntry>,
}

impl PendingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an optimistic message, bumping the attempt counter when the
    /// same identity was dispatched before. Returns the attempt number.
    pub fn track(&mut self, key: IdentityKey, provisional_id: MessageId, now: DateTime<Utc>) -> u32 {
        let attempt = self.entries.get(&key).map_or(1, |e| e.attempt + 1);
        self.entries.insert(
            key.clone(),
            PendingEntry {
                identity_key: key,
                provisional_id,
                dispatched_at: now,
                attempt,
            },
        );
        attempt
    }

    /// Remove and return the entry for `key`, if any.
    pub fn resolve(&mut self, key: &IdentityKey) -> Option<PendingEntry> {
        self.entries.remove(key)
    }

    /// Remove and return the entry holding `provisional_id`, if any.
    pub fn resolve_by_id(&mut self, provisional_id: &MessageId) -> Option<PendingEntry> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| &e.provisional_id == provisional_id)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key)
    }

    /// Remove and return every entry older than `max_age` at `now`.
    pub fn reclaim_stale(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<PendingEntry> {
        let stale: Vec<IdentityKey> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                (now - e.dispatched_at)
                    .to_std()
                    .is_ok_and(|age| age >= max_age)
            })
            .map(|(k, _)| k.clone())
            .collect();
        stale
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .collect()
    }

    /// Whether `key` is currently awaiting confirmation.
    #[must_use]
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of in-flight entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, e.g. when switching conversations.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
