//! HTTP client for the channel directory, history pages and message sends.

use message_stream::{
    ChannelId, Cursor, FetchError, Message, MessageSubmitter, Page, PageFetcher, SendError,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("server is unavailable: {0}")]
    Unavailable(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("channel not found or not accessible")]
    NotFound,

    /// 400/422 with the server's reason.
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Http(reqwest::Error),
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Http(err)
        }
    }

    /// Classify a non-success status, reading `{"message": …}` from the body
    /// when the server sent one.
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            });
        match status {
            StatusCode::UNAUTHORIZED => Self::AuthRequired,
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Self::Rejected(message),
            _ => Self::Server {
                status: status.as_u16(),
                message,
            },
        }
    }

    async fn from_response(resp: Response) -> Self {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::from_status(status, &body)
    }
}

impl From<ApiError> for FetchError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::AuthRequired => Self::AuthRequired,
            ApiError::NotFound => Self::NotFound,
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<ApiError> for SendError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::AuthRequired => Self::AuthRequired,
            ApiError::NotFound => Self::NotFound,
            ApiError::Rejected(message) => Self::Validation(message),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Entry in the channel directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub member_count: u32,
}

#[derive(Deserialize)]
struct ChannelList {
    #[serde(default)]
    channels: Vec<ChannelSummary>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    message: Message,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    session_cookie: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ServerConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(config.base_url.clone()));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ApiError::Http)?;
        Ok(Self {
            http,
            base_url,
            session_cookie: config.session_cookie.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.session_cookie {
            Some(cookie) => req.header(header::COOKIE, cookie),
            None => req,
        }
    }

    async fn execute(&self, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = req.send().await.map_err(ApiError::from_reqwest)?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let err = ApiError::from_response(resp).await;
            warn!(error = %err, "request failed");
            Err(err)
        }
    }

    /// `GET /api/channels`
    pub async fn list_channels(&self) -> Result<Vec<ChannelSummary>, ApiError> {
        let url = self.url(&["api", "channels"])?;
        let resp = self.execute(self.request(Method::GET, url)).await?;
        let list: ChannelList = resp.json().await.map_err(ApiError::from_reqwest)?;
        Ok(list.channels)
    }

    /// `GET /api/channels/{id}/messages[?cursor=…]`
    pub async fn get_page(
        &self,
        channel: &ChannelId,
        cursor: Option<&Cursor>,
    ) -> Result<Page, ApiError> {
        let url = self.url(&["api", "channels", channel.as_str(), "messages"])?;
        let mut req = self.request(Method::GET, url);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor.as_str())]);
        }
        debug!(%channel, has_cursor = cursor.is_some(), "fetching page");
        let resp = self.execute(req).await?;
        resp.json().await.map_err(ApiError::from_reqwest)
    }

    /// `POST /api/channels/{id}/messages`
    pub async fn post_message(&self, channel: &ChannelId, text: &str) -> Result<Message, ApiError> {
        let url = self.url(&["api", "channels", channel.as_str(), "messages"])?;
        let req = self
            .request(Method::POST, url)
            .json(&SendRequest { text });
        let resp = self.execute(req).await?;
        let body: SendResponse = resp.json().await.map_err(ApiError::from_reqwest)?;
        debug!(%channel, message_id = %body.message.id, "message accepted");
        Ok(body.message)
    }
}

impl PageFetcher for ApiClient {
    async fn fetch_page(
        &self,
        channel: &ChannelId,
        cursor: Option<&Cursor>,
    ) -> Result<Page, FetchError> {
        self.get_page(channel, cursor).await.map_err(FetchError::from)
    }
}

impl MessageSubmitter for ApiClient {
    async fn submit_message(&self, channel: &ChannelId, text: &str) -> Result<Message, SendError> {
        self.post_message(channel, text)
            .await
            .map_err(SendError::from)
    }
}
