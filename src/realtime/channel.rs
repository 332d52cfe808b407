//! In-process change feed over unbounded channels.
//!
//! Fans every published change out to the subscribers whose filter matches.
//! Lets several engine instances in one process observe the same store the
//! way remote clients would observe a hosted one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::feed::{
    ChangeFilter, FeedFuture, FeedSubscription, RealtimeFeed, RealtimeResult, RowChange,
};

#[derive(Debug)]
struct Subscriber {
    filter: ChangeFilter,
    sender: mpsc::UnboundedSender<RowChange>,
}

#[derive(Debug, Default)]
struct FeedShared {
    next_id: AtomicU64,
    subscribers: DashMap<u64, Subscriber>,
}

/// Feed that fans published changes out to in-process subscribers.
#[derive(Debug, Default)]
pub struct ChannelFeed {
    shared: Arc<FeedShared>,
}

impl ChannelFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for pushing changes into this feed.
    #[must_use]
    pub fn publisher(&self) -> FeedPublisher {
        FeedPublisher {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }
}

impl RealtimeFeed for ChannelFeed {
    fn subscribe(
        &self,
        filter: ChangeFilter,
    ) -> FeedFuture<'_, RealtimeResult<Box<dyn FeedSubscription>>> {
        Box::pin(async move {
            let (sender, receiver) = mpsc::unbounded_channel();
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %filter.channel_key(), "feed subscription opened");
            self.shared
                .subscribers
                .insert(id, Subscriber { filter, sender });
            let subscription = ChannelSubscription {
                id,
                shared: Arc::clone(&self.shared),
                receiver,
                active: true,
            };
            Ok(Box::new(subscription) as Box<dyn FeedSubscription>)
        })
    }
}

/// Cloneable handle for publishing changes into a [`ChannelFeed`].
#[derive(Debug, Clone)]
pub struct FeedPublisher {
    shared: Arc<FeedShared>,
}

impl FeedPublisher {
    /// Deliver `change` to every subscriber whose filter matches.
    pub fn publish(&self, change: &RowChange) {
        let mut dropped: Vec<u64> = Vec::new();
        for entry in self.shared.subscribers.iter() {
            if entry.value().filter.matches(change)
                && entry.value().sender.send(change.clone()).is_err()
            {
                dropped.push(*entry.key());
            }
        }
        for id in dropped {
            self.shared.subscribers.remove(&id);
        }
    }
}

#[derive(Debug)]
struct ChannelSubscription {
    id: u64,
    shared: Arc<FeedShared>,
    receiver: mpsc::UnboundedReceiver<RowChange>,
    active: bool,
}

impl FeedSubscription for ChannelSubscription {
    fn next_change(&mut self) -> FeedFuture<'_, Option<RowChange>> {
        Box::pin(async move {
            if !self.active {
                return None;
            }
            self.receiver.recv().await
        })
    }

    fn cancel(&mut self) {
        if self.active {
            self.active = false;
            self.shared.subscribers.remove(&self.id);
            self.receiver.close();
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
