//! Live feed subscription seam.
//!
//! `subscribe` hands back a [`Subscription`]: an id plus a stream of typed
//! events. Cancelling is an explicit `unsubscribe(id)`. The stream ending
//! without an unsubscribe means the subscription broke.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::error::FeedError;
use crate::model::{ChannelId, Message};

/// Event name carried by message-created pushes.
pub const MESSAGE_CREATED_EVENT: &str = "message:new";

/// Deterministic push topic for a channel.
pub fn topic_name(channel: &ChannelId) -> String {
    format!("channel-{}", channel)
}

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    MessageCreated { message: Message },
}

/// An open subscription to one channel's live feed.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    channel: ChannelId,
    events: mpsc::Receiver<LiveEvent>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, channel: ChannelId, events: mpsc::Receiver<LiveEvent>) -> Self {
        Self {
            id,
            channel,
            events,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.events.recv().await
    }
}

pub trait LiveFeed: Send + Sync + 'static {
    fn subscribe(
        &self,
        channel: &ChannelId,
    ) -> impl Future<Output = Result<Subscription, FeedError>> + Send;

    /// Stop delivery for `id`. Events already in flight may still surface;
    /// consumers discard them by subscription id.
    fn unsubscribe(&self, id: SubscriptionId);
}
