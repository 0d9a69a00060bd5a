//! Message stream synchronization for chat channels.
//!
//! Reconciles the initial history load, cursor pagination and a live push
//! feed into one ordered, duplicate-free view per channel, with optimistic
//! sends and channel switching on top.

pub mod error;
pub mod fetcher;
pub mod live_feed;
pub mod merge;
pub mod model;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use error::{FeedError, FetchError, RecoveryAction, SendError, StreamError};
pub use fetcher::{MessageSubmitter, PageFetcher};
pub use live_feed::{LiveEvent, LiveFeed, Subscription, SubscriptionId};
pub use merge::{LiveMerge, MergeBuffer, PageMerge, SendMerge, StreamEntry, StreamSnapshot, StreamStatus};
pub use model::{Author, ChannelId, Cursor, LocalId, Message, MessageId, Page};
pub use session::{ChannelSession, LiveStatus, SessionConfig, SessionSnapshot, SessionToken, SessionUpdate};
