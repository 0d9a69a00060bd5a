//! WebSocket live feed.
//!
//! Every subscription gets its own connection to the push endpoint: connect,
//! send `subscribe` for the channel topic, wait for the `subscribed` ack,
//! then pump `message:new` events for that topic into the subscription.
//! Events for other topics or event names are ignored. Unsubscribing sends
//! `unsubscribe` and closes the connection; the server closing it ends the
//! subscription stream, which the session treats as a broken feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use message_stream::live_feed::{MESSAGE_CREATED_EVENT, topic_name};
use message_stream::{
    ChannelId, FeedError, LiveEvent, LiveFeed, Message, Subscription, SubscriptionId,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

const EVENT_BUFFER: usize = 256;

type PushStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PushSink = SplitSink<PushStream, tungstenite::Message>;
type PushSource = SplitStream<PushStream>;

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Event {
        topic: String,
        event: String,
        /// Payload shape depends on `event`; decoded only for events we handle.
        data: serde_json::Value,
    },
    Subscribed {
        topic: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push server is unavailable: {0}")]
    Unavailable(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("push protocol error: {0}")]
    Protocol(String),
}

impl PushError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(resp) if resp.status().as_u16() == 401 => Self::AuthRequired,
            tungstenite::Error::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Self::Unavailable(err.to_string())
            }
            tungstenite::Error::Url(_) | tungstenite::Error::Protocol(_) => {
                Self::Protocol(err.to_string())
            }
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

impl From<PushError> for FeedError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::AuthRequired => Self::AuthRequired,
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Decode one server text frame into a live event for `topic`, if it is one.
pub fn decode_frame(topic: &str, text: &str) -> Option<LiveEvent> {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%topic, "unparseable push frame: {}", e);
            return None;
        }
    };
    match frame {
        ServerFrame::Event {
            topic: event_topic,
            event,
            data,
        } => {
            if event_topic != topic || event != MESSAGE_CREATED_EVENT {
                debug!(%topic, %event_topic, %event, "ignoring push event");
                return None;
            }
            match serde_json::from_value::<Message>(data) {
                Ok(message) => Some(LiveEvent::MessageCreated { message }),
                Err(e) => {
                    warn!(%topic, "malformed message payload: {}", e);
                    None
                }
            }
        }
        ServerFrame::Subscribed { .. } => None,
        ServerFrame::Error { message } => {
            warn!(%topic, "push server error: {}", message);
            None
        }
    }
}

fn text_frame(frame: &ClientFrame) -> Result<tungstenite::Message, PushError> {
    let json = serde_json::to_string(frame).map_err(|e| PushError::Protocol(e.to_string()))?;
    Ok(tungstenite::Message::Text(json.into()))
}

type Registry = Arc<Mutex<HashMap<SubscriptionId, CancellationToken>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<SubscriptionId, CancellationToken>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct PushClient {
    push_url: String,
    session_cookie: Option<String>,
    handshake_timeout: Duration,
    subscriptions: Registry,
}

impl PushClient {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            push_url: config.push_url.clone(),
            session_cookie: config.session_cookie.clone(),
            handshake_timeout: config.request_timeout,
            subscriptions: Arc::default(),
        }
    }

    /// Number of subscriptions with a live connection.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    async fn open(&self, channel: &ChannelId) -> Result<Subscription, PushError> {
        let topic = topic_name(channel);

        let mut request = self
            .push_url
            .as_str()
            .into_client_request()
            .map_err(PushError::from_tungstenite)?;
        if let Some(cookie) = &self.session_cookie {
            let value =
                HeaderValue::from_str(cookie).map_err(|e| PushError::Protocol(e.to_string()))?;
            request.headers_mut().insert(header::COOKIE, value);
        }

        // The timeout covers the TCP connect and upgrade as well as the ack.
        let (sink, source, early) =
            tokio::time::timeout(self.handshake_timeout, handshake(request, &topic))
                .await
                .map_err(|_| PushError::Unavailable("timed out opening push subscription".into()))??;

        let id = SubscriptionId::next();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        lock(&self.subscriptions).insert(id, cancel.clone());
        info!(%channel, subscription = %id, "push subscription open");

        tokio::spawn(pump(
            PumpCtx {
                id,
                topic,
                cancel,
                registry: self.subscriptions.clone(),
            },
            sink,
            source,
            tx,
            early,
        ));
        Ok(Subscription::new(id, channel.clone(), rx))
    }
}

async fn handshake(
    request: tungstenite::handshake::client::Request,
    topic: &str,
) -> Result<(PushSink, PushSource, Vec<LiveEvent>), PushError> {
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(PushError::from_tungstenite)?;
    let (mut sink, mut source) = ws.split();

    sink.send(text_frame(&ClientFrame::Subscribe {
        topic: topic.to_string(),
    })?)
    .await
    .map_err(PushError::from_tungstenite)?;

    let early = await_ack(topic, &mut source).await?;
    Ok((sink, source, early))
}

/// Read frames until the server acknowledges `topic`. Events for the topic
/// that arrive first are returned so they can be delivered after the ack.
async fn await_ack(topic: &str, source: &mut PushSource) -> Result<Vec<LiveEvent>, PushError> {
    let mut early = Vec::new();
    loop {
        let text = match source.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => text,
            Some(Ok(tungstenite::Message::Close(_))) | None => {
                return Err(PushError::Unavailable(
                    "connection closed before subscription ack".into(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(PushError::from_tungstenite(err)),
        };
        match serde_json::from_str::<ServerFrame>(text.as_str()) {
            Ok(ServerFrame::Subscribed { topic: acked }) if acked == topic => return Ok(early),
            Ok(ServerFrame::Error { message }) => return Err(PushError::Rejected(message)),
            _ => early.extend(decode_frame(topic, text.as_str())),
        }
    }
}

struct PumpCtx {
    id: SubscriptionId,
    topic: String,
    cancel: CancellationToken,
    registry: Registry,
}

async fn pump(
    ctx: PumpCtx,
    mut sink: PushSink,
    mut source: PushSource,
    tx: mpsc::Sender<LiveEvent>,
    early: Vec<LiveEvent>,
) {
    for event in early {
        if tx.send(event).await.is_err() {
            break;
        }
    }

    let unsubscribed = loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break true,
            // Subscription handle dropped without an unsubscribe
            _ = tx.closed() => break true,
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => {
                if let Some(event) = decode_frame(&ctx.topic, text.as_str()) {
                    if tx.send(event).await.is_err() {
                        break true;
                    }
                }
            }
            Some(Ok(tungstenite::Message::Close(_))) | None => {
                info!(subscription = %ctx.id, "push connection closed by server");
                break false;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(subscription = %ctx.id, "push connection failed: {}", err);
                break false;
            }
        }
    };

    if unsubscribed {
        if let Ok(frame) = text_frame(&ClientFrame::Unsubscribe {
            topic: ctx.topic.clone(),
        }) {
            let _ = sink.send(frame).await;
        }
        let _ = sink.close().await;
        debug!(subscription = %ctx.id, "push subscription closed");
    }
    lock(&ctx.registry).remove(&ctx.id);
}

impl LiveFeed for PushClient {
    async fn subscribe(&self, channel: &ChannelId) -> Result<Subscription, FeedError> {
        self.open(channel).await.map_err(|err| {
            warn!(%channel, "push subscribe failed: {}", err);
            FeedError::from(err)
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(cancel) = lock(&self.subscriptions).remove(&id) {
            cancel.cancel();
            debug!(subscription = %id, "unsubscribing");
        }
    }
}
