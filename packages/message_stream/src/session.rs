//! Channel Session Controller
//!
//! Owns which channel is active and drives the page fetcher and the live feed
//! for it. Fetches, sends and subscriptions run as spawned tasks that report
//! back through a single inbox. Every report carries the [`SessionToken`] of
//! the activation that issued it; reports with a superseded token are
//! dropped unapplied. All merges happen on the task that owns the session,
//! one inbox message at a time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{FeedError, FetchError, SendError, StreamError};
use crate::fetcher::{MessageSubmitter, PageFetcher};
use crate::live_feed::{LiveEvent, LiveFeed, Subscription, SubscriptionId};
use crate::merge::{LiveMerge, MergeBuffer, SendMerge, StreamSnapshot, StreamStatus};
use crate::model::{Author, ChannelId, Cursor, LocalId, Message, Page};

const DEFAULT_RESUBSCRIBE_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);
const DEFAULT_INBOX_CAPACITY: usize = 256;
const DEFAULT_MAX_CATCH_UP_PAGES: u32 = 5;

/// Identity of one activation. Minted fresh on every activate and on
/// session loss, so results issued under an older token can be recognized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionToken(u64);

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Connecting,
    Live,
    /// Subscription failed or broke; a resubscribe is scheduled.
    Degraded,
    Off,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub resubscribe_initial: Duration,
    pub resubscribe_max: Duration,
    pub inbox_capacity: usize,
    /// Upper bound on newest-first pages fetched to close a gap after the
    /// live feed comes back.
    pub max_catch_up_pages: u32,
    /// Used to match live echoes to pending sends. Learned from the first
    /// confirmed send when not set.
    pub local_author: Option<Author>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resubscribe_initial: DEFAULT_RESUBSCRIBE_INITIAL,
            resubscribe_max: DEFAULT_RESUBSCRIBE_MAX,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            max_catch_up_pages: DEFAULT_MAX_CATCH_UP_PAGES,
            local_author: None,
        }
    }
}

impl SessionConfig {
    /// Delay before resubscribe attempt `attempt` (1-based): doubles from
    /// `resubscribe_initial`, capped at `resubscribe_max`.
    pub fn resubscribe_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.resubscribe_initial
            .saturating_mul(factor)
            .min(self.resubscribe_max)
    }
}

/// Read-only view of the active channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub channel: ChannelId,
    pub token: SessionToken,
    pub live: LiveStatus,
    #[serde(flatten)]
    pub stream: StreamSnapshot,
}

/// What happened when one inbox message was processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    InitialLoaded {
        added: usize,
        has_older: bool,
    },
    OlderLoaded {
        added: usize,
        has_older: bool,
    },
    /// A newest-first page fetched after reconnecting was merged.
    CaughtUp {
        added: usize,
    },
    /// An initial or older history page failed.
    LoadFailed {
        error: StreamError,
    },
    /// The newest-page re-read after subscribing failed. Applied history
    /// is untouched; the gap closes on the next reconnect.
    CatchUpFailed {
        error: StreamError,
    },
    Live(LiveMerge),
    SendConfirmed {
        local_id: LocalId,
        outcome: SendMerge,
    },
    SendFailed {
        local_id: LocalId,
        error: StreamError,
    },
    LiveFeedConnected,
    LiveFeedDegraded {
        error: StreamError,
        retry_in: Duration,
    },
    LiveFeedReconnecting {
        attempt: u32,
    },
    /// Session lost. Nothing else happens for this channel until it is
    /// activated again after a login.
    LoginRequired,
    /// A result from a superseded activation or subscription, or a failure
    /// for a send its echo already settled, was discarded.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageRequest {
    Initial,
    Older,
    /// Newest-first page after a reconnect; `remaining` further pages may
    /// be followed if no overlap with known messages is found.
    CatchUp { remaining: u32 },
}

enum Inbound {
    Page {
        token: SessionToken,
        request: PageRequest,
        result: Result<Page, FetchError>,
    },
    Sent {
        token: SessionToken,
        local_id: LocalId,
        result: Result<Message, SendError>,
    },
    Subscribed {
        token: SessionToken,
        result: Result<Subscription, FeedError>,
    },
    Live {
        token: SessionToken,
        subscription: SubscriptionId,
        event: LiveEvent,
    },
    FeedClosed {
        token: SessionToken,
        subscription: SubscriptionId,
    },
    Resubscribe {
        token: SessionToken,
    },
}

impl Inbound {
    fn token(&self) -> SessionToken {
        match self {
            Self::Page { token, .. }
            | Self::Sent { token, .. }
            | Self::Subscribed { token, .. }
            | Self::Live { token, .. }
            | Self::FeedClosed { token, .. }
            | Self::Resubscribe { token } => *token,
        }
    }
}

/// What a spawned task needs to report back under the right token.
#[derive(Clone)]
struct TaskCtx {
    token: SessionToken,
    channel: ChannelId,
    cancel: CancellationToken,
}

struct ActiveChannel {
    channel: ChannelId,
    token: SessionToken,
    buffer: MergeBuffer,
    cancel: CancellationToken,
    subscription: Option<SubscriptionId>,
    live: LiveStatus,
    resubscribe_attempts: u32,
}

impl ActiveChannel {
    fn task_ctx(&self) -> TaskCtx {
        TaskCtx {
            token: self.token,
            channel: self.channel.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

pub struct ChannelSession<A, L> {
    api: Arc<A>,
    feed: Arc<L>,
    config: SessionConfig,
    local_author: Option<Author>,
    active: Option<ActiveChannel>,
    last_token: u64,
    inbox_tx: mpsc::Sender<Inbound>,
    inbox_rx: mpsc::Receiver<Inbound>,
}

impl<A, L> ChannelSession<A, L>
where
    A: PageFetcher + MessageSubmitter,
    L: LiveFeed,
{
    pub fn new(api: A, feed: L, config: SessionConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        Self {
            api: Arc::new(api),
            feed: Arc::new(feed),
            local_author: config.local_author.clone(),
            config,
            active: None,
            last_token: 0,
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn active_channel(&self) -> Option<&ChannelId> {
        self.active.as_ref().map(|a| &a.channel)
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.active.as_ref().map(|a| a.token)
    }

    pub fn local_author(&self) -> Option<&Author> {
        self.local_author.as_ref()
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.active.as_ref().map(|a| SessionSnapshot {
            channel: a.channel.clone(),
            token: a.token,
            live: a.live,
            stream: a.buffer.snapshot(),
        })
    }

    fn mint_token(&mut self) -> SessionToken {
        self.last_token += 1;
        SessionToken(self.last_token)
    }

    // ── activation ─────────────────────────────────────────────────────

    /// Make `channel` the active channel. The previous channel, if any, is
    /// deactivated first; its in-flight work is cancelled and any result it
    /// still produces is discarded. Issues the initial fetch and the live
    /// subscription concurrently.
    pub fn activate(&mut self, channel: ChannelId) -> SessionToken {
        self.deactivate();

        let token = self.mint_token();
        let mut buffer = MergeBuffer::new();
        buffer.begin_initial_load();
        let active = ActiveChannel {
            channel,
            token,
            buffer,
            cancel: CancellationToken::new(),
            subscription: None,
            live: LiveStatus::Connecting,
            resubscribe_attempts: 0,
        };
        let ctx = active.task_ctx();
        info!(channel = %ctx.channel, %token, "activating channel");
        self.active = Some(active);

        self.spawn_fetch(ctx.clone(), PageRequest::Initial, None);
        self.spawn_subscribe(ctx);
        token
    }

    /// Cancel the active channel's subscription and in-flight work and
    /// discard its state.
    pub fn deactivate(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        if let Some(id) = active.subscription {
            self.feed.unsubscribe(id);
        }
        info!(channel = %active.channel, token = %active.token, "deactivated channel");
    }

    // ── commands ───────────────────────────────────────────────────────

    /// Request the next older page. Returns false, issuing nothing, when
    /// there is no older history, a load is outstanding, or the initial
    /// load has not completed.
    pub fn load_more(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let Some(cursor) = active.buffer.begin_older_load() else {
            debug!(channel = %active.channel, status = ?active.buffer.status(), "load_more ignored");
            return false;
        };
        let ctx = active.task_ctx();
        self.spawn_fetch(ctx, PageRequest::Older, Some(cursor));
        true
    }

    /// Insert `text` as a pending entry and submit it. Empty or whitespace
    /// only text is rejected before any request is made.
    pub fn send(&mut self, text: &str) -> Result<LocalId, SendError> {
        let Some(active) = self.active.as_mut() else {
            return Err(SendError::Validation("no channel is active".into()));
        };
        if text.trim().is_empty() {
            let err = SendError::Validation("message text is empty".into());
            active.buffer.set_error(StreamError::Validation {
                message: "message text is empty".into(),
            });
            return Err(err);
        }
        if active.buffer.error() == Some(&StreamError::AuthRequired) {
            return Err(SendError::AuthRequired);
        }

        let local_id = active
            .buffer
            .push_pending(text.to_string(), self.local_author.clone());
        let ctx = active.task_ctx();
        debug!(channel = %ctx.channel, %local_id, "submitting message");
        self.spawn_submit(ctx, local_id, text.to_string());
        Ok(local_id)
    }

    /// Reissue the initial fetch after a retryable initial-load failure.
    pub fn retry(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        let retryable = active.buffer.status() == StreamStatus::Failed
            && active.buffer.error().is_some_and(StreamError::is_retryable);
        if !retryable {
            return false;
        }
        active.buffer.begin_initial_load();
        let ctx = active.task_ctx();
        info!(channel = %ctx.channel, "retrying initial load");
        self.spawn_fetch(ctx, PageRequest::Initial, None);
        true
    }

    // ── inbox ──────────────────────────────────────────────────────────

    /// Wait for the next completion and apply it. Cancel safe, so it can
    /// sit in a `select!` next to other input sources.
    ///
    /// Returns `None` only if the inbox closed, which cannot happen while
    /// the session is alive.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let inbound = self.inbox_rx.recv().await?;
        Some(self.apply(inbound))
    }

    /// Apply one completion if one is already waiting.
    pub fn try_next_update(&mut self) -> Option<SessionUpdate> {
        let inbound = self.inbox_rx.try_recv().ok()?;
        Some(self.apply(inbound))
    }

    fn apply(&mut self, inbound: Inbound) -> SessionUpdate {
        let token = inbound.token();
        if self.token() != Some(token) {
            if let Inbound::Subscribed {
                result: Ok(subscription),
                ..
            } = &inbound
            {
                // Opened after its channel was left; close it right away.
                self.feed.unsubscribe(subscription.id());
            }
            debug!(%token, "discarding result from superseded session");
            return SessionUpdate::Stale;
        }

        match inbound {
            Inbound::Page {
                request, result, ..
            } => self.on_page(request, result),
            Inbound::Sent {
                local_id, result, ..
            } => self.on_sent(local_id, result),
            Inbound::Subscribed { result, .. } => self.on_subscribed(result),
            Inbound::Live {
                subscription,
                event,
                ..
            } => self.on_live(subscription, event),
            Inbound::FeedClosed { subscription, .. } => self.on_feed_closed(subscription),
            Inbound::Resubscribe { .. } => self.on_resubscribe(),
        }
    }

    fn on_page(&mut self, request: PageRequest, result: Result<Page, FetchError>) -> SessionUpdate {
        let page = match result {
            Ok(page) => page,
            Err(FetchError::AuthRequired) => return self.login_required(),
            Err(err) => return self.on_page_error(request, err),
        };
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::Stale;
        };

        match request {
            PageRequest::Initial => {
                let outcome = active.buffer.apply_initial_page(page);
                let has_older = active.buffer.has_older();
                info!(channel = %active.channel, added = outcome.added, has_older, "initial page applied");
                SessionUpdate::InitialLoaded {
                    added: outcome.added,
                    has_older,
                }
            }
            PageRequest::Older => {
                let outcome = active.buffer.apply_older_page(page);
                let has_older = active.buffer.has_older();
                debug!(
                    channel = %active.channel,
                    added = outcome.added,
                    duplicates = outcome.duplicates,
                    has_older,
                    "older page applied"
                );
                SessionUpdate::OlderLoaded {
                    added: outcome.added,
                    has_older,
                }
            }
            PageRequest::CatchUp { remaining } => {
                let overlaps =
                    page.is_empty() || page.messages.iter().any(|m| active.buffer.contains(&m.id));
                let next = page.next_cursor.clone();
                let outcome = active.buffer.apply_catch_up(page);
                debug!(channel = %active.channel, added = outcome.added, overlaps, "catch-up page applied");

                if !overlaps && remaining > 0 {
                    if let Some(cursor) = next {
                        let ctx = active.task_ctx();
                        self.spawn_fetch(
                            ctx,
                            PageRequest::CatchUp {
                                remaining: remaining - 1,
                            },
                            Some(cursor),
                        );
                    }
                }
                SessionUpdate::CaughtUp {
                    added: outcome.added,
                }
            }
        }
    }

    fn on_page_error(&mut self, request: PageRequest, err: FetchError) -> SessionUpdate {
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::Stale;
        };
        let error = StreamError::from(err);
        warn!(channel = %active.channel, ?request, code = error.error_code(), "page fetch failed: {}", error);
        match request {
            PageRequest::Initial => active.buffer.fail_initial_load(error.clone()),
            PageRequest::Older => active.buffer.fail_older_load(error.clone()),
            PageRequest::CatchUp { .. } => {
                active.buffer.set_error(error.clone());
                return SessionUpdate::CatchUpFailed { error };
            }
        }
        SessionUpdate::LoadFailed { error }
    }

    fn on_sent(&mut self, local_id: LocalId, result: Result<Message, SendError>) -> SessionUpdate {
        match result {
            Ok(message) => {
                if self.local_author.is_none() {
                    self.local_author = Some(message.user.clone());
                }
                let Some(active) = self.active.as_mut() else {
                    return SessionUpdate::Stale;
                };
                let outcome = active.buffer.confirm_send(local_id, message);
                debug!(channel = %active.channel, %local_id, ?outcome, "send confirmed");
                SessionUpdate::SendConfirmed { local_id, outcome }
            }
            Err(SendError::AuthRequired) => self.login_required(),
            Err(err) => {
                let Some(active) = self.active.as_mut() else {
                    return SessionUpdate::Stale;
                };
                warn!(channel = %active.channel, %local_id, code = err.error_code(), "send failed: {}", err);
                match active.buffer.fail_send(local_id, &err) {
                    Some(error) => SessionUpdate::SendFailed { local_id, error },
                    None => {
                        debug!(channel = %active.channel, %local_id, "failure for settled send dropped");
                        SessionUpdate::Stale
                    }
                }
            }
        }
    }

    fn on_subscribed(&mut self, result: Result<Subscription, FeedError>) -> SessionUpdate {
        let subscription = match result {
            Ok(subscription) => subscription,
            Err(FeedError::AuthRequired) => return self.login_required(),
            Err(err) => return self.degrade(err.into()),
        };
        let Some(active) = self.active.as_mut() else {
            self.feed.unsubscribe(subscription.id());
            return SessionUpdate::Stale;
        };

        active.subscription = Some(subscription.id());
        active.live = LiveStatus::Live;
        active.resubscribe_attempts = 0;
        active.buffer.clear_degraded();
        info!(channel = %active.channel, subscription = %subscription.id(), "live feed connected");

        // Applied history may predate the subscription: re-read the newest page.
        let catch_up = matches!(
            active.buffer.status(),
            StreamStatus::Ready | StreamStatus::LoadingOlder
        );
        let ctx = active.task_ctx();
        self.spawn_forwarder(ctx.clone(), subscription);
        if catch_up {
            let remaining = self.config.max_catch_up_pages.saturating_sub(1);
            self.spawn_fetch(ctx, PageRequest::CatchUp { remaining }, None);
        }
        SessionUpdate::LiveFeedConnected
    }

    fn on_live(&mut self, subscription: SubscriptionId, event: LiveEvent) -> SessionUpdate {
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::Stale;
        };
        if active.subscription != Some(subscription) {
            debug!(channel = %active.channel, %subscription, "discarding event from replaced subscription");
            return SessionUpdate::Stale;
        }
        match event {
            LiveEvent::MessageCreated { message } => {
                SessionUpdate::Live(active.buffer.apply_live(message))
            }
        }
    }

    fn on_feed_closed(&mut self, subscription: SubscriptionId) -> SessionUpdate {
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::Stale;
        };
        if active.subscription != Some(subscription) {
            return SessionUpdate::Stale;
        }
        active.subscription = None;
        self.degrade(StreamError::LiveFeedDegraded {
            message: "live feed closed".into(),
        })
    }

    fn degrade(&mut self, error: StreamError) -> SessionUpdate {
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::Stale;
        };
        active.live = LiveStatus::Degraded;
        active.resubscribe_attempts = active.resubscribe_attempts.saturating_add(1);
        let retry_in = self.config.resubscribe_delay(active.resubscribe_attempts);
        active.buffer.set_error(error.clone());
        warn!(
            channel = %active.channel,
            attempt = active.resubscribe_attempts,
            retry_in_ms = retry_in.as_millis() as u64,
            "live feed degraded: {}",
            error
        );
        let ctx = active.task_ctx();
        self.spawn_resubscribe_timer(ctx, retry_in);
        SessionUpdate::LiveFeedDegraded { error, retry_in }
    }

    fn on_resubscribe(&mut self) -> SessionUpdate {
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::Stale;
        };
        if active.live != LiveStatus::Degraded {
            return SessionUpdate::Stale;
        }
        active.live = LiveStatus::Connecting;
        let attempt = active.resubscribe_attempts;
        let ctx = active.task_ctx();
        debug!(channel = %ctx.channel, attempt, "resubscribing");
        self.spawn_subscribe(ctx);
        SessionUpdate::LiveFeedReconnecting { attempt }
    }

    /// Session lost: stop all work for the channel and refuse further
    /// results by rotating the token.
    fn login_required(&mut self) -> SessionUpdate {
        let token = self.mint_token();
        let Some(active) = self.active.as_mut() else {
            return SessionUpdate::LoginRequired;
        };
        active.cancel.cancel();
        if let Some(id) = active.subscription.take() {
            self.feed.unsubscribe(id);
        }
        active.token = token;
        active.cancel = CancellationToken::new();
        active.live = LiveStatus::Off;
        active.buffer.fail_auth();
        warn!(channel = %active.channel, "authentication required");
        SessionUpdate::LoginRequired
    }

    // ── tasks ──────────────────────────────────────────────────────────

    fn spawn_fetch(&self, ctx: TaskCtx, request: PageRequest, cursor: Option<Cursor>) {
        let api = self.api.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return,
                result = api.fetch_page(&ctx.channel, cursor.as_ref()) => result,
            };
            let _ = tx
                .send(Inbound::Page {
                    token: ctx.token,
                    request,
                    result,
                })
                .await;
        });
    }

    fn spawn_submit(&self, ctx: TaskCtx, local_id: LocalId, text: String) {
        let api = self.api.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return,
                result = api.submit_message(&ctx.channel, &text) => result,
            };
            let _ = tx
                .send(Inbound::Sent {
                    token: ctx.token,
                    local_id,
                    result,
                })
                .await;
        });
    }

    fn spawn_subscribe(&self, ctx: TaskCtx) {
        let feed = self.feed.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return,
                result = feed.subscribe(&ctx.channel) => result,
            };
            // A subscription that reaches a stale session is unsubscribed
            // by the session, so always report it.
            let _ = tx
                .send(Inbound::Subscribed {
                    token: ctx.token,
                    result,
                })
                .await;
        });
    }

    fn spawn_forwarder(&self, ctx: TaskCtx, mut subscription: Subscription) {
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let id = subscription.id();
            loop {
                let event = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return,
                    event = subscription.recv() => event,
                };
                let inbound = match event {
                    Some(event) => Inbound::Live {
                        token: ctx.token,
                        subscription: id,
                        event,
                    },
                    None => {
                        let _ = tx
                            .send(Inbound::FeedClosed {
                                token: ctx.token,
                                subscription: id,
                            })
                            .await;
                        return;
                    }
                };
                if tx.send(inbound).await.is_err() {
                    return;
                }
            }
        });
    }

    fn spawn_resubscribe_timer(&self, ctx: TaskCtx, delay: Duration) {
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Inbound::Resubscribe { token: ctx.token }).await;
                }
            }
        });
    }
}
