//! Merge buffer for one channel's stream state.
//!
//! History pages, live events and optimistic sends all land here. Confirmed
//! messages are kept unique by id and ascending by `(created_at, id)`, with a
//! hash index next to the ordered sequence so every duplicate check is O(1).
//! Pending sends sit after the confirmed messages in submission order until
//! the server confirms or rejects them.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{SendError, StreamError};
use crate::model::{Author, Cursor, LocalId, Message, MessageId, Page};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Empty,
    LoadingInitial,
    Ready,
    /// Ready, with a load-more request outstanding. Live merges still apply.
    LoadingOlder,
    Failed,
}

/// A locally submitted message the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMessage {
    pub local_id: LocalId,
    pub text: String,
    pub author: Option<Author>,
    pub submitted_at: DateTime<Utc>,
}

impl PendingMessage {
    /// Whether `message` looks like the live echo of this send. A send
    /// with no known author is never claimed; its confirmation settles it.
    fn matches_echo(&self, message: &Message) -> bool {
        self.text == message.text
            && self
                .author
                .as_ref()
                .is_some_and(|author| author.id == message.user.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "delivery", rename_all = "snake_case")]
pub enum StreamEntry {
    Confirmed(Message),
    Pending(PendingMessage),
}

impl StreamEntry {
    pub fn text(&self) -> &str {
        match self {
            Self::Confirmed(message) => &message.text,
            Self::Pending(pending) => &pending.text,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Confirmed(message) => Some(message),
            Self::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Result of applying a history page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMerge {
    pub added: usize,
    pub duplicates: usize,
}

/// Result of applying one live event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveMerge {
    Appended { id: MessageId },
    /// Arrived behind the current tail and was placed by creation order.
    Inserted { id: MessageId, position: usize },
    /// Echo of a local send; the pending entry was swapped for the server copy.
    ReplacedPending { id: MessageId, local_id: LocalId },
    Duplicate { id: MessageId },
}

/// Result of a send confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendMerge {
    Confirmed { id: MessageId },
    /// The live echo got there first; nothing was inserted twice.
    AlreadyPresent { id: MessageId },
}

/// Read-only copy of a stream state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSnapshot {
    pub status: StreamStatus,
    pub entries: Vec<StreamEntry>,
    pub has_older: bool,
    pub error: Option<StreamError>,
}

impl StreamSnapshot {
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().filter_map(StreamEntry::message)
    }

    pub fn message_ids(&self) -> Vec<&str> {
        self.messages().map(|m| m.id.as_str()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }
}

#[derive(Debug)]
pub struct MergeBuffer {
    confirmed: VecDeque<Message>,
    ids: HashSet<MessageId>,
    pending: Vec<PendingMessage>,
    next_cursor: Option<Cursor>,
    status: StreamStatus,
    error: Option<StreamError>,
}

impl Default for MergeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeBuffer {
    pub fn new() -> Self {
        Self {
            confirmed: VecDeque::new(),
            ids: HashSet::new(),
            pending: Vec::new(),
            next_cursor: None,
            status: StreamStatus::Empty,
            error: None,
        }
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn has_older(&self) -> bool {
        self.next_cursor.is_some()
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        self.next_cursor.as_ref()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Confirmed messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.confirmed.iter()
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let entries = self
            .confirmed
            .iter()
            .cloned()
            .map(StreamEntry::Confirmed)
            .chain(self.pending.iter().cloned().map(StreamEntry::Pending))
            .collect();
        StreamSnapshot {
            status: self.status,
            entries,
            has_older: self.has_older(),
            error: self.error.clone(),
        }
    }

    // ── page application ───────────────────────────────────────────────

    pub fn begin_initial_load(&mut self) {
        self.status = StreamStatus::LoadingInitial;
        self.error = None;
    }

    pub fn apply_initial_page(&mut self, page: Page) -> PageMerge {
        let outcome = self.merge_messages(page.messages);
        self.next_cursor = page.next_cursor;
        self.status = StreamStatus::Ready;
        outcome
    }

    pub fn fail_initial_load(&mut self, err: StreamError) {
        self.status = StreamStatus::Failed;
        self.error = Some(err);
    }

    /// Enter the load-more overlay. Returns the cursor to fetch with, or
    /// `None` when there is nothing older or a load is already outstanding.
    pub fn begin_older_load(&mut self) -> Option<Cursor> {
        if self.status != StreamStatus::Ready {
            return None;
        }
        let cursor = self.next_cursor.clone()?;
        self.status = StreamStatus::LoadingOlder;
        self.clear_load_error();
        Some(cursor)
    }

    pub fn apply_older_page(&mut self, page: Page) -> PageMerge {
        let outcome = self.merge_messages(page.messages);
        self.next_cursor = page.next_cursor;
        if self.status == StreamStatus::LoadingOlder {
            self.status = StreamStatus::Ready;
        }
        self.clear_load_error();
        outcome
    }

    /// Leave the overlay with existing state intact and a retryable error.
    pub fn fail_older_load(&mut self, err: StreamError) {
        if self.status == StreamStatus::LoadingOlder {
            self.status = StreamStatus::Ready;
        }
        self.error = Some(err);
    }

    /// Merge a page fetched to fill a gap at the newer edge. The older-page
    /// cursor is left alone.
    pub fn apply_catch_up(&mut self, page: Page) -> PageMerge {
        self.merge_messages(page.messages)
    }

    fn merge_messages(&mut self, messages: Vec<Message>) -> PageMerge {
        let mut outcome = PageMerge::default();
        for message in messages {
            if self.ids.contains(&message.id) {
                outcome.duplicates += 1;
                continue;
            }
            self.insert_ordered(message);
            outcome.added += 1;
        }
        outcome
    }

    fn insert_ordered(&mut self, message: Message) -> usize {
        let position = self
            .confirmed
            .partition_point(|m| m.sort_key() <= message.sort_key());
        self.ids.insert(message.id.clone());
        self.confirmed.insert(position, message);
        position
    }

    // ── live events ────────────────────────────────────────────────────

    pub fn apply_live(&mut self, message: Message) -> LiveMerge {
        if self.ids.contains(&message.id) {
            debug!(message_id = %message.id, "dropping duplicate live delivery");
            return LiveMerge::Duplicate { id: message.id };
        }

        let claimed = self
            .pending
            .iter()
            .position(|p| p.matches_echo(&message))
            .map(|i| self.pending.remove(i).local_id);

        let id = message.id.clone();
        let tail = self.confirmed.len();
        let position = self.insert_ordered(message);

        match claimed {
            Some(local_id) => {
                debug!(message_id = %id, %local_id, "live echo replaced pending send");
                LiveMerge::ReplacedPending { id, local_id }
            }
            None if position == tail => LiveMerge::Appended { id },
            None => {
                debug!(message_id = %id, position, "live event placed behind tail");
                LiveMerge::Inserted { id, position }
            }
        }
    }

    // ── optimistic sends ───────────────────────────────────────────────

    pub fn push_pending(&mut self, text: String, author: Option<Author>) -> LocalId {
        let local_id = LocalId::new();
        self.pending.push(PendingMessage {
            local_id,
            text,
            author,
            submitted_at: Utc::now(),
        });
        local_id
    }

    /// Finalize a send with the server's copy of the message.
    pub fn confirm_send(&mut self, local_id: LocalId, message: Message) -> SendMerge {
        self.pending.retain(|p| p.local_id != local_id);
        if self.ids.contains(&message.id) {
            return SendMerge::AlreadyPresent { id: message.id };
        }
        let id = message.id.clone();
        self.insert_ordered(message);
        SendMerge::Confirmed { id }
    }

    /// Drop a rejected send and surface the failure in the error slot.
    ///
    /// Returns `None` without touching the slot when the send is no longer
    /// pending, i.e. its live echo already settled it.
    pub fn fail_send(&mut self, local_id: LocalId, err: &SendError) -> Option<StreamError> {
        let index = self.pending.iter().position(|p| p.local_id == local_id)?;
        let text = self.pending.remove(index).text;
        let slot = StreamError::send_failed(local_id, text, err);
        self.error = Some(slot.clone());
        Some(slot)
    }

    // ── error slot ─────────────────────────────────────────────────────

    pub fn set_error(&mut self, err: StreamError) {
        self.error = Some(err);
    }

    /// Clear the slot if it holds a history fetch failure.
    fn clear_load_error(&mut self) {
        if matches!(
            self.error,
            Some(StreamError::Transient { .. } | StreamError::NotFound)
        ) {
            self.error = None;
        }
    }

    /// Clear the slot if it currently holds a live-feed degradation.
    pub fn clear_degraded(&mut self) {
        if matches!(self.error, Some(StreamError::LiveFeedDegraded { .. })) {
            self.error = None;
        }
    }

    /// Session lost: abandon pending sends and mark the stream failed.
    pub fn fail_auth(&mut self) {
        self.pending.clear();
        self.status = StreamStatus::Failed;
        self.error = Some(StreamError::AuthRequired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(id: &str) -> Author {
        Author {
            id: id.to_string(),
            name: id.to_uppercase(),
            email: None,
        }
    }

    fn msg(id: &str, secs: i64) -> Message {
        msg_by(id, secs, "u1", &format!("text {id}"))
    }

    fn msg_by(id: &str, secs: i64, user: &str, text: &str) -> Message {
        Message {
            id: MessageId::new(id),
            text: text.to_string(),
            created_at: DateTime::from_timestamp(secs, 0).unwrap(),
            user: author(user),
        }
    }

    fn page(ids: &[(&str, i64)], cursor: Option<&str>) -> Page {
        Page::new(
            ids.iter().map(|(id, secs)| msg(id, *secs)).collect(),
            cursor.map(Cursor::new),
        )
    }

    fn ready(ids: &[(&str, i64)], cursor: Option<&str>) -> MergeBuffer {
        let mut buf = MergeBuffer::new();
        buf.begin_initial_load();
        buf.apply_initial_page(page(ids, cursor));
        buf
    }

    fn ids(buf: &MergeBuffer) -> Vec<String> {
        buf.messages().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn starts_empty() {
        let buf = MergeBuffer::new();
        assert_eq!(buf.status(), StreamStatus::Empty);
        assert!(buf.is_empty());
        assert!(!buf.has_older());
        assert!(buf.error().is_none());
    }

    #[test]
    fn empty_first_page_is_ready() {
        let mut buf = MergeBuffer::new();
        buf.begin_initial_load();
        assert_eq!(buf.status(), StreamStatus::LoadingInitial);

        let outcome = buf.apply_initial_page(Page::default());
        assert_eq!(outcome, PageMerge::default());
        assert_eq!(buf.status(), StreamStatus::Ready);
        assert!(buf.is_empty());
        assert!(!buf.has_older());
    }

    #[test]
    fn initial_failure_sets_slot() {
        let mut buf = MergeBuffer::new();
        buf.begin_initial_load();
        buf.fail_initial_load(StreamError::NotFound);
        assert_eq!(buf.status(), StreamStatus::Failed);
        assert_eq!(buf.error(), Some(&StreamError::NotFound));
    }

    #[test]
    fn older_page_is_prepended_and_cursor_replaced() {
        let mut buf = ready(&[("m3", 30), ("m4", 40)], Some("c1"));

        let cursor = buf.begin_older_load().unwrap();
        assert_eq!(cursor, Cursor::new("c1"));
        assert_eq!(buf.status(), StreamStatus::LoadingOlder);

        let outcome = buf.apply_older_page(page(&[("m1", 10), ("m2", 20)], None));
        assert_eq!(outcome.added, 2);
        assert_eq!(ids(&buf), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(buf.status(), StreamStatus::Ready);
        assert!(!buf.has_older());
    }

    #[test]
    fn page_boundary_overlap_is_dropped() {
        let mut buf = ready(&[("m3", 30), ("m4", 40)], Some("c1"));
        buf.begin_older_load();
        let outcome = buf.apply_older_page(page(&[("m2", 20), ("m3", 30)], None));
        assert_eq!(
            outcome,
            PageMerge {
                added: 1,
                duplicates: 1
            }
        );
        assert_eq!(ids(&buf), vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn load_more_is_refused_without_cursor_or_while_outstanding() {
        let mut buf = ready(&[("m1", 10)], None);
        assert!(buf.begin_older_load().is_none());

        let mut buf = ready(&[("m2", 20)], Some("c1"));
        assert!(buf.begin_older_load().is_some());
        assert!(buf.begin_older_load().is_none());

        let mut loading = MergeBuffer::new();
        loading.begin_initial_load();
        assert!(loading.begin_older_load().is_none());
    }

    #[test]
    fn older_failure_keeps_state() {
        let mut buf = ready(&[("m2", 20)], Some("c1"));
        buf.begin_older_load();
        buf.fail_older_load(StreamError::Transient {
            message: "timeout".into(),
        });
        assert_eq!(buf.status(), StreamStatus::Ready);
        assert_eq!(ids(&buf), vec!["m2"]);
        assert_eq!(buf.next_cursor(), Some(&Cursor::new("c1")));
        assert!(buf.error().unwrap().is_retryable());
        assert!(buf.begin_older_load().is_some());
    }

    #[test]
    fn older_load_retry_clears_error() {
        let mut buf = ready(&[("m2", 20)], Some("c1"));
        buf.begin_older_load();
        buf.fail_older_load(StreamError::Transient {
            message: "timeout".into(),
        });

        assert_eq!(buf.begin_older_load(), Some(Cursor::new("c1")));
        assert!(buf.error().is_none());
        buf.apply_older_page(page(&[("m1", 10)], None));
        assert_eq!(buf.status(), StreamStatus::Ready);
        assert!(buf.error().is_none());
        assert_eq!(ids(&buf), vec!["m1", "m2"]);
    }

    #[test]
    fn older_page_keeps_unrelated_errors() {
        let mut buf = ready(&[("m2", 20)], Some("c1"));
        let local_id = buf.push_pending("hi".into(), Some(author("me")));
        buf.fail_send(local_id, &SendError::Transient("reset".into()));

        buf.begin_older_load();
        buf.apply_older_page(page(&[("m1", 10)], None));
        assert_eq!(buf.error().unwrap().error_code(), "send_failed");
    }

    #[test]
    fn live_events_append_and_dedup() {
        let mut buf = ready(&[("m1", 10)], None);
        assert_eq!(
            buf.apply_live(msg("m2", 20)),
            LiveMerge::Appended {
                id: MessageId::new("m2")
            }
        );
        assert_eq!(
            buf.apply_live(msg("m2", 20)),
            LiveMerge::Duplicate {
                id: MessageId::new("m2")
            }
        );
        assert_eq!(ids(&buf), vec!["m1", "m2"]);
    }

    #[test]
    fn late_live_event_keeps_order() {
        let mut buf = ready(&[("m1", 10), ("m3", 30)], None);
        let outcome = buf.apply_live(msg("m2", 20));
        assert_eq!(
            outcome,
            LiveMerge::Inserted {
                id: MessageId::new("m2"),
                position: 1
            }
        );
        assert_eq!(ids(&buf), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn live_during_older_load_lands_at_tail() {
        let mut buf = ready(&[("m20", 20), ("m21", 21)], Some("c1"));
        buf.begin_older_load();
        buf.apply_live(msg("m99", 99));
        assert_eq!(buf.status(), StreamStatus::LoadingOlder);
        assert_eq!(ids(&buf), vec!["m20", "m21", "m99"]);

        buf.apply_older_page(page(&[("m1", 1), ("m2", 2)], None));
        assert_eq!(ids(&buf), vec!["m1", "m2", "m20", "m21", "m99"]);
    }

    #[test]
    fn pending_sits_after_confirmed() {
        let mut buf = ready(&[("m1", 10)], None);
        let local_id = buf.push_pending("hi".into(), Some(author("me")));
        buf.apply_live(msg_by("m2", 20, "other", "hello"));

        let snap = buf.snapshot();
        assert_eq!(snap.entries.len(), 3);
        assert!(snap.entries[2].is_pending());
        assert_eq!(snap.entries[2].text(), "hi");
        assert_eq!(snap.pending_count(), 1);
        assert_eq!(buf.pending()[0].local_id, local_id);
    }

    #[test]
    fn send_confirmation_replaces_pending() {
        let mut buf = ready(&[("m1", 10)], None);
        let local_id = buf.push_pending("hi".into(), Some(author("me")));

        let outcome = buf.confirm_send(local_id, msg_by("m99", 20, "me", "hi"));
        assert_eq!(
            outcome,
            SendMerge::Confirmed {
                id: MessageId::new("m99")
            }
        );
        assert!(buf.pending().is_empty());
        assert_eq!(ids(&buf), vec!["m1", "m99"]);

        // Echo after confirmation is a plain duplicate
        assert!(matches!(
            buf.apply_live(msg_by("m99", 20, "me", "hi")),
            LiveMerge::Duplicate { .. }
        ));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn echo_before_confirmation_yields_single_entry() {
        let mut buf = ready(&[("m1", 10)], None);
        let local_id = buf.push_pending("hi".into(), Some(author("me")));

        let outcome = buf.apply_live(msg_by("m99", 20, "me", "hi"));
        assert_eq!(
            outcome,
            LiveMerge::ReplacedPending {
                id: MessageId::new("m99"),
                local_id
            }
        );
        assert!(buf.pending().is_empty());

        let outcome = buf.confirm_send(local_id, msg_by("m99", 20, "me", "hi"));
        assert_eq!(
            outcome,
            SendMerge::AlreadyPresent {
                id: MessageId::new("m99")
            }
        );
        assert_eq!(ids(&buf), vec!["m1", "m99"]);
    }

    #[test]
    fn echo_from_another_author_does_not_claim_pending() {
        let mut buf = ready(&[], None);
        buf.push_pending("hi".into(), Some(author("me")));
        let outcome = buf.apply_live(msg_by("m5", 5, "someone", "hi"));
        assert!(matches!(outcome, LiveMerge::Appended { .. }));
        assert_eq!(buf.pending().len(), 1);
    }

    #[test]
    fn echo_never_claims_send_with_unknown_author() {
        let mut buf = ready(&[], None);
        let local_id = buf.push_pending("ok".into(), None);
        let outcome = buf.apply_live(msg_by("m5", 5, "someone", "ok"));
        assert!(matches!(outcome, LiveMerge::Appended { .. }));
        assert_eq!(buf.pending().len(), 1);

        let slot = buf
            .fail_send(local_id, &SendError::Transient("reset".into()))
            .unwrap();
        match slot {
            StreamError::SendFailed { text, .. } => assert_eq!(text, "ok"),
            other => panic!("expected SendFailed, got {other:?}"),
        }
        assert_eq!(ids(&buf), vec!["m5"]);
    }

    #[test]
    fn failure_after_echo_settled_is_ignored() {
        let mut buf = ready(&[], None);
        let local_id = buf.push_pending("hi".into(), Some(author("me")));
        buf.apply_live(msg_by("m5", 5, "me", "hi"));

        assert!(buf
            .fail_send(local_id, &SendError::Transient("reset".into()))
            .is_none());
        assert!(buf.error().is_none());
        assert_eq!(ids(&buf), vec!["m5"]);
    }

    #[test]
    fn mismatched_echo_claim_still_converges() {
        // Two identical sends; the echo of the second claims the first
        // pending entry. Both confirmations must still leave one entry each.
        let mut buf = ready(&[], None);
        let first = buf.push_pending("hi".into(), Some(author("me")));
        let second = buf.push_pending("hi".into(), Some(author("me")));

        buf.apply_live(msg_by("m2", 2, "me", "hi"));
        assert_eq!(buf.pending().len(), 1);
        assert_eq!(buf.pending()[0].local_id, second);

        buf.confirm_send(first, msg_by("m1", 1, "me", "hi"));
        buf.confirm_send(second, msg_by("m2", 2, "me", "hi"));
        assert!(buf.pending().is_empty());
        assert_eq!(ids(&buf), vec!["m1", "m2"]);
    }

    #[test]
    fn failed_send_is_removed_and_surfaced() {
        let mut buf = ready(&[("m1", 10)], None);
        let local_id = buf.push_pending("hi".into(), None);

        let slot = buf
            .fail_send(local_id, &SendError::Transient("reset".into()))
            .unwrap();
        assert!(buf.pending().is_empty());
        assert_eq!(buf.error(), Some(&slot));
        match slot {
            StreamError::SendFailed {
                text, retryable, ..
            } => {
                assert_eq!(text, "hi");
                assert!(retryable);
            }
            other => panic!("expected SendFailed, got {other:?}"),
        }
    }

    #[test]
    fn catch_up_leaves_cursor_alone() {
        let mut buf = ready(&[("m5", 50), ("m6", 60)], Some("c1"));
        let outcome = buf.apply_catch_up(page(&[("m6", 60), ("m7", 70)], None));
        assert_eq!(outcome.added, 1);
        assert_eq!(buf.next_cursor(), Some(&Cursor::new("c1")));
        assert_eq!(ids(&buf), vec!["m5", "m6", "m7"]);
    }

    #[test]
    fn auth_failure_drops_pending() {
        let mut buf = ready(&[("m1", 10)], None);
        buf.push_pending("hi".into(), None);
        buf.fail_auth();
        assert_eq!(buf.status(), StreamStatus::Failed);
        assert_eq!(buf.error(), Some(&StreamError::AuthRequired));
        assert!(buf.pending().is_empty());
        assert_eq!(ids(&buf), vec!["m1"]);
    }

    #[test]
    fn clear_degraded_only_clears_feed_errors() {
        let mut buf = ready(&[], None);
        buf.set_error(StreamError::LiveFeedDegraded {
            message: "closed".into(),
        });
        buf.clear_degraded();
        assert!(buf.error().is_none());

        buf.set_error(StreamError::NotFound);
        buf.clear_degraded();
        assert_eq!(buf.error(), Some(&StreamError::NotFound));
    }

    #[test]
    fn snapshot_serializes_delivery_tag() {
        let mut buf = ready(&[("m1", 10)], None);
        buf.push_pending("hi".into(), None);
        let json = serde_json::to_value(buf.snapshot()).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["entries"][0]["delivery"], "confirmed");
        assert_eq!(json["entries"][0]["id"], "m1");
        assert_eq!(json["entries"][1]["delivery"], "pending");
        assert_eq!(json["entries"][1]["text"], "hi");
    }
}
