//! Realtime change propagation:
//! - feed trait, filters and change rows
//! - in-process channel implementation with a publisher handle
//! - decoding of change rows into engine actions

pub mod apply;
pub mod channel;
pub mod feed;

pub use apply::{FeedAction, decode};
pub use channel::{ChannelFeed, FeedPublisher};
pub use feed::{
    ChangeEvent, ChangeFilter, ChangeTable, FeedFuture, FeedSubscription, RealtimeError,
    RealtimeFeed, RealtimeResult, RowChange,
};
