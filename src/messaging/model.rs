//! Domain types shared by the messaging components.

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::MessagingError;

/// An identity that can send and receive messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Database row id.
    pub id: i64,
    /// Unique username.
    pub username: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// A resolved sender or receiver reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Identity row id.
    pub id: i64,
    /// Username at the time of the query.
    pub username: String,
}

/// A directed message from one sender to one receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Database row id.
    pub id: i64,
    /// Who sent the message.
    pub sender: Participant,
    /// Who the message is addressed to.
    pub receiver: Participant,
    /// Message this one replies to, if any.
    pub parent_id: Option<i64>,
    /// Current content.
    pub content: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Whether the content was ever changed after creation.
    pub edited: bool,
    /// When the content was last changed.
    pub edited_at: Option<String>,
    /// Who last changed the content.
    pub editor_id: Option<i64>,
    /// Whether the receiver has read the message.
    pub read: bool,
}

impl Message {
    /// Whether `identity_id` sent or received this message.
    pub fn involves(&self, identity_id: i64) -> bool {
        self.sender.id == identity_id || self.receiver.id == identity_id
    }
}

/// Snapshot of a message's content taken right before an edit overwrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Database row id.
    pub id: i64,
    /// The edited message.
    pub message_id: i64,
    /// Content as it was before the edit.
    pub old_content: String,
    /// When the snapshot was taken.
    pub captured_at: String,
    /// Who performed the edit (weak reference).
    pub editor_id: Option<i64>,
}

/// Per-recipient record that a message needs attention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Database row id.
    pub id: i64,
    /// Identity being notified.
    pub recipient_id: i64,
    /// Message that triggered the notification.
    pub message_id: i64,
    /// Whether the recipient dismissed the notification.
    pub is_read: bool,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// A node of a reconstructed reply tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadNode {
    /// Message id.
    pub id: i64,
    /// Current content.
    pub content: String,
    /// Who sent the message.
    pub sender: Participant,
    /// Who the message is addressed to.
    pub receiver: Participant,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Whether the content was edited.
    pub edited: bool,
    /// Direct replies, oldest first.
    pub children: Vec<ThreadNode>,
}

impl ThreadNode {
    /// Build a leaf node from a message.
    pub fn leaf(message: Message) -> Self {
        Self {
            id: message.id,
            content: message.content,
            sender: message.sender,
            receiver: message.receiver,
            created_at: message.created_at,
            edited: message.edited,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        let mut count: usize = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count = count.saturating_add(1);
            stack.extend(node.children.iter());
        }
        count
    }
}

/// A top-level message in an inbox along with its first-level replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// The root message.
    pub message: Message,
    /// Number of direct replies.
    pub reply_count: u64,
    /// Direct replies, oldest first.
    pub replies: Vec<Message>,
}

/// Current time as an RFC 3339 UTC string with microsecond precision.
///
/// Fixed precision keeps lexical and chronological order identical.
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// A creation timestamp strictly later than `earlier`.
///
/// Returns the current time, or `earlier` plus one microsecond when the clock
/// has not advanced past it.
///
/// # Errors
///
/// Returns [`MessagingError::ConsistencyViolation`] if `earlier` is not a
/// valid RFC 3339 timestamp.
pub fn timestamp_after(earlier: &str) -> Result<String, MessagingError> {
    timestamp_after_at(earlier, Utc::now())
}

/// [`timestamp_after`] against an explicit clock reading.
///
/// `now` is truncated to the stored microsecond precision before comparing,
/// so a reading inside the same microsecond as `earlier` still bumps.
fn timestamp_after_at(earlier: &str, now: DateTime<Utc>) -> Result<String, MessagingError> {
    let earlier = DateTime::parse_from_rfc3339(earlier)
        .map_err(|e| {
            MessagingError::ConsistencyViolation(format!("unparseable timestamp {earlier:?}: {e}"))
        })?
        .with_timezone(&Utc);
    let now = now.trunc_subsecs(6);
    if now > earlier {
        return Ok(format_timestamp(now));
    }
    let bumped = earlier
        .checked_add_signed(TimeDelta::microseconds(1))
        .ok_or_else(|| MessagingError::ConsistencyViolation("timestamp overflow".to_owned()))?;
    Ok(format_timestamp(bumped))
}

/// Normalise a caller-supplied RFC 3339 timestamp to the stored UTC format.
///
/// # Errors
///
/// Returns [`MessagingError::Validation`] if `value` does not parse.
pub fn parse_timestamp(value: &str) -> Result<String, MessagingError> {
    let parsed = DateTime::parse_from_rfc3339(value.trim())
        .map_err(|e| MessagingError::Validation(format!("invalid timestamp {value:?}: {e}")))?;
    Ok(format_timestamp(parsed.with_timezone(&Utc)))
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
