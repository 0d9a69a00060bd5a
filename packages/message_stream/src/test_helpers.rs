//! Scripted collaborators for session tests.
//!
//! `FakeApi` parks every fetch and submit until the test answers it, so a
//! test controls exactly how completions interleave. `FakeFeed` hands out
//! in-memory subscriptions the test can publish into or break. Both act
//! only once their futures are polled.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::{mpsc, oneshot};

use crate::error::{FeedError, FetchError, SendError};
use crate::fetcher::{MessageSubmitter, PageFetcher};
use crate::live_feed::{LiveEvent, LiveFeed, Subscription, SubscriptionId};
use crate::model::{Author, ChannelId, Cursor, Message, MessageId, Page};

const CALL_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn author(id: &str) -> Author {
    Author {
        id: id.to_string(),
        name: id.to_uppercase(),
        email: None,
    }
}

pub(crate) fn msg(id: &str, secs: i64) -> Message {
    msg_by(id, secs, "u1", &format!("text {id}"))
}

pub(crate) fn msg_by(id: &str, secs: i64, user: &str, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        text: text.to_string(),
        created_at: DateTime::from_timestamp(secs, 0).expect("valid timestamp"),
        user: author(user),
    }
}

/// Page of messages `m{n}` created at second `n`, for every `n` in `range`.
pub(crate) fn page_of(range: std::ops::Range<i64>, cursor: Option<&str>) -> Page {
    Page::new(
        range.map(|n| msg(&format!("m{n}"), n)).collect(),
        cursor.map(Cursor::new),
    )
}

pub(crate) struct FetchCall {
    pub channel: ChannelId,
    pub cursor: Option<Cursor>,
    respond: oneshot::Sender<Result<Page, FetchError>>,
}

impl FetchCall {
    pub fn respond(self, result: Result<Page, FetchError>) {
        let _ = self.respond.send(result);
    }
}

pub(crate) struct SubmitCall {
    pub channel: ChannelId,
    pub text: String,
    respond: oneshot::Sender<Result<Message, SendError>>,
}

impl SubmitCall {
    pub fn respond(self, result: Result<Message, SendError>) {
        let _ = self.respond.send(result);
    }
}

#[derive(Clone)]
pub(crate) struct FakeApi {
    fetches: mpsc::UnboundedSender<FetchCall>,
    submits: mpsc::UnboundedSender<SubmitCall>,
}

pub(crate) struct ApiCalls {
    fetches: mpsc::UnboundedReceiver<FetchCall>,
    submits: mpsc::UnboundedReceiver<SubmitCall>,
}

pub(crate) fn fake_api() -> (FakeApi, ApiCalls) {
    let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
    let (submit_tx, submit_rx) = mpsc::unbounded_channel();
    (
        FakeApi {
            fetches: fetch_tx,
            submits: submit_tx,
        },
        ApiCalls {
            fetches: fetch_rx,
            submits: submit_rx,
        },
    )
}

impl ApiCalls {
    pub async fn next_fetch(&mut self) -> FetchCall {
        tokio::time::timeout(CALL_TIMEOUT, self.fetches.recv())
            .await
            .expect("timed out waiting for a fetch")
            .expect("fake api dropped")
    }

    pub async fn next_submit(&mut self) -> SubmitCall {
        tokio::time::timeout(CALL_TIMEOUT, self.submits.recv())
            .await
            .expect("timed out waiting for a submit")
            .expect("fake api dropped")
    }

    /// True if no fetch has been issued since the last `next_fetch`.
    pub async fn no_fetch_issued(&mut self) -> bool {
        settle().await;
        self.fetches.try_recv().is_err()
    }

    pub async fn no_submit_issued(&mut self) -> bool {
        settle().await;
        self.submits.try_recv().is_err()
    }
}

impl PageFetcher for FakeApi {
    fn fetch_page(
        &self,
        channel: &ChannelId,
        cursor: Option<&Cursor>,
    ) -> impl Future<Output = Result<Page, FetchError>> + Send {
        let fetches = self.fetches.clone();
        let channel = channel.clone();
        let cursor = cursor.cloned();
        async move {
            let (tx, rx) = oneshot::channel();
            let _ = fetches.send(FetchCall {
                channel,
                cursor,
                respond: tx,
            });
            rx.await
                .unwrap_or_else(|_| Err(FetchError::Transient("request dropped".into())))
        }
    }
}

impl MessageSubmitter for FakeApi {
    fn submit_message(
        &self,
        channel: &ChannelId,
        text: &str,
    ) -> impl Future<Output = Result<Message, SendError>> + Send {
        let submits = self.submits.clone();
        let channel = channel.clone();
        let text = text.to_string();
        async move {
            let (tx, rx) = oneshot::channel();
            let _ = submits.send(SubmitCall {
                channel,
                text,
                respond: tx,
            });
            rx.await
                .unwrap_or_else(|_| Err(SendError::Transient("request dropped".into())))
        }
    }
}

#[derive(Default)]
struct FeedState {
    open: HashMap<SubscriptionId, (ChannelId, mpsc::Sender<LiveEvent>)>,
    failures: VecDeque<FeedError>,
    subscribe_calls: usize,
    unsubscribed: Vec<SubscriptionId>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeFeed {
    state: Arc<Mutex<FeedState>>,
}

impl FakeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to every open subscription on `channel`.
    pub fn publish(&self, channel: &ChannelId, message: Message) -> usize {
        let state = self.state.lock().unwrap();
        state
            .open
            .values()
            .filter(|(ch, _)| ch == channel)
            .filter(|(_, tx)| {
                tx.try_send(LiveEvent::MessageCreated {
                    message: message.clone(),
                })
                .is_ok()
            })
            .count()
    }

    pub fn fail_next_subscribe(&self, err: FeedError) {
        self.state.lock().unwrap().failures.push_back(err);
    }

    /// Drop the server side of every subscription on `channel`.
    pub fn break_subscriptions(&self, channel: &ChannelId) {
        self.state
            .lock()
            .unwrap()
            .open
            .retain(|_, (ch, _)| ch != channel);
    }

    pub fn open_count(&self, channel: &ChannelId) -> usize {
        self.state
            .lock()
            .unwrap()
            .open
            .values()
            .filter(|(ch, _)| ch == channel)
            .count()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().unwrap().subscribe_calls
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionId> {
        self.state.lock().unwrap().unsubscribed.clone()
    }
}

impl LiveFeed for FakeFeed {
    fn subscribe(
        &self,
        channel: &ChannelId,
    ) -> impl Future<Output = Result<Subscription, FeedError>> + Send {
        let state = self.state.clone();
        let channel = channel.clone();
        async move {
            let mut state = state.lock().unwrap();
            state.subscribe_calls += 1;
            match state.failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    let (tx, rx) = mpsc::channel(64);
                    let id = SubscriptionId::next();
                    state.open.insert(id, (channel.clone(), tx));
                    Ok(Subscription::new(id, channel, rx))
                }
            }
        }
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.lock().unwrap();
        state.open.remove(&id);
        state.unsubscribed.push(id);
    }
}

/// Let spawned tasks run until they park.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
