//! Seams to the history and send endpoints.
//!
//! Implementations report results only; they never touch a `MergeBuffer`.
//! The session controller decides what to apply.

use std::future::Future;

use crate::error::{FetchError, SendError};
use crate::model::{ChannelId, Cursor, Message, Page};

pub trait PageFetcher: Send + Sync + 'static {
    /// Fetch one page of history older than `cursor`, or the most recent
    /// page when `cursor` is `None`. Messages come back oldest first.
    fn fetch_page(
        &self,
        channel: &ChannelId,
        cursor: Option<&Cursor>,
    ) -> impl Future<Output = Result<Page, FetchError>> + Send;
}

pub trait MessageSubmitter: Send + Sync + 'static {
    /// Submit `text` and return the finalized message with its
    /// server-issued identifier and timestamp.
    fn submit_message(
        &self,
        channel: &ChannelId,
        text: &str,
    ) -> impl Future<Output = Result<Message, SendError>> + Send;
}
