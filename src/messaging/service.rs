//! The delivery surface used by the transport layer.
//!
//! Every write here is one explicit transaction: the primary row plus its
//! derived rows (revision, notification, cascade purge) commit together or not
//! at all. Writes that fail with [`MessagingError::TransactionFailure`] are
//! retried as a whole, up to the configured attempt limit.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::model::{
    now_timestamp, parse_timestamp, timestamp_after, Identity, InboxEntry, Message, Notification,
    Revision, ThreadNode,
};
use super::retention::{self, RemovalReport};
use super::revisions::{self, ContentEdit};
use super::store::{self, MessageStore, NewMessage};
use super::{notifications, thread, unread, MessagingError};
use crate::config::Config;

/// The identity on whose behalf an operation runs.
///
/// Built by the authentication layer; request payloads never carry a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    id: i64,
}

impl Caller {
    /// Wrap an identity id that has already been authenticated.
    pub fn authenticated(identity_id: i64) -> Self {
        Self { id: identity_id }
    }

    /// The caller's identity id.
    pub fn id(&self) -> i64 {
        self.id
    }
}

/// Payload of a send request.
#[derive(Debug, Clone)]
pub struct SendMessage {
    /// Who the message is addressed to.
    pub receiver_id: i64,
    /// Message body.
    pub content: String,
    /// Message being replied to, if any.
    pub parent_id: Option<i64>,
}

/// Payload of an edit request.
#[derive(Debug, Clone)]
pub struct EditMessage {
    /// Message to edit.
    pub message_id: i64,
    /// Replacement body.
    pub content: String,
    /// Explicit edit time (RFC 3339); defaults to now.
    pub edited_at: Option<String>,
}

/// Result of an edit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EditResult {
    /// The message after the edit.
    pub message: Message,
    /// Whether the content changed and a revision was stored.
    pub revision_recorded: bool,
}

/// How often a contended write is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

const DEFAULT_MAX_CONTENT_BYTES: usize = 65_536;

/// Threaded messaging operations over a [`MessageStore`].
#[derive(Debug, Clone)]
pub struct MessagingService {
    store: MessageStore,
    max_content_bytes: usize,
    retry: RetryPolicy,
}

impl MessagingService {
    /// Service with default limits and retry policy.
    pub fn new(store: MessageStore) -> Self {
        Self {
            store,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
            retry: RetryPolicy::default(),
        }
    }

    /// Service using the `[limits]` and `[retry]` sections of `config`.
    pub fn from_config(store: MessageStore, config: &Config) -> Self {
        Self {
            store,
            max_content_bytes: config.limits.max_content_bytes,
            retry: RetryPolicy {
                max_attempts: config.retry.max_attempts,
                backoff: Duration::from_millis(config.retry.backoff_ms),
            },
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the content size limit.
    #[must_use]
    pub fn with_max_content_bytes(mut self, max_content_bytes: usize) -> Self {
        self.max_content_bytes = max_content_bytes;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Identities
    // -----------------------------------------------------------------------

    /// Register a new identity.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Validation`] for a blank or taken username.
    pub async fn create_identity(&self, username: &str) -> Result<Identity, MessagingError> {
        self.with_retry("create_identity", move || async move {
            let mut tx = self.store.begin().await?;
            let identity = store::create_identity(&mut tx, username).await?;
            tx.commit().await?;
            info!(identity_id = identity.id, username = %identity.username, "identity created");
            Ok::<_, MessagingError>(identity)
        })
        .await
    }

    /// Look up an identity by username.
    pub async fn identity_by_name(&self, username: &str) -> Result<Option<Identity>, MessagingError> {
        let mut conn = self.store.acquire().await?;
        store::identity_by_name(&mut conn, username).await
    }

    /// Look up an identity by id.
    pub async fn find_identity(&self, id: i64) -> Result<Option<Identity>, MessagingError> {
        let mut conn = self.store.acquire().await?;
        store::find_identity(&mut conn, id).await
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Send a message from the caller.
    ///
    /// The message row and its notification are written in one transaction.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Validation`] for empty or oversized content, or an
    ///   unknown receiver.
    /// - [`MessagingError::NotFound`] for an unknown caller or parent.
    pub async fn send_message(
        &self,
        caller: Caller,
        request: &SendMessage,
    ) -> Result<Message, MessagingError> {
        let content = self.validate_content(&request.content)?;
        self.with_retry("send_message", move || self.send_once(caller, request, content))
            .await
    }

    async fn send_once(
        &self,
        caller: Caller,
        request: &SendMessage,
        content: &str,
    ) -> Result<Message, MessagingError> {
        let mut tx = self.store.begin().await?;

        // Locks the receiver row so it cannot be removed before we commit.
        if !store::lock_identity(&mut tx, request.receiver_id).await? {
            return Err(MessagingError::Validation(format!(
                "receiver {} does not exist",
                request.receiver_id
            )));
        }
        if store::find_identity(&mut tx, caller.id()).await?.is_none() {
            return Err(MessagingError::NotFound(format!("identity {}", caller.id())));
        }

        let created_at = match request.parent_id {
            Some(parent_id) => {
                let parent = store::get_message(&mut tx, parent_id)
                    .await?
                    .ok_or_else(|| MessagingError::NotFound(format!("parent message {parent_id}")))?;
                timestamp_after(&parent.created_at)?
            }
            None => now_timestamp(),
        };

        let id = store::insert_message(
            &mut tx,
            &NewMessage {
                sender_id: caller.id(),
                receiver_id: request.receiver_id,
                parent_id: request.parent_id,
                content,
                created_at: &created_at,
            },
        )
        .await?;
        let message = store::get_message(&mut tx, id).await?.ok_or_else(|| {
            MessagingError::ConsistencyViolation(format!("message {id} vanished after insert"))
        })?;
        notifications::dispatch(&mut tx, &message).await?;
        tx.commit().await?;

        info!(
            message_id = message.id,
            sender_id = message.sender.id,
            receiver_id = message.receiver.id,
            parent_id = ?message.parent_id,
            "message sent"
        );
        Ok(message)
    }

    /// Edit a message the caller sent.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::Validation`] for invalid content or `edited_at`.
    /// - [`MessagingError::NotFound`] for an unknown message.
    /// - [`MessagingError::Forbidden`] when the caller is not the sender.
    pub async fn edit_message(
        &self,
        caller: Caller,
        request: &EditMessage,
    ) -> Result<EditResult, MessagingError> {
        let content = self.validate_content(&request.content)?;
        let edited_at = request.edited_at.as_deref().map(parse_timestamp).transpose()?;
        let edited_at = edited_at.as_deref();
        self.with_retry("edit_message", move || {
            self.edit_once(caller, request.message_id, content, edited_at)
        })
        .await
    }

    async fn edit_once(
        &self,
        caller: Caller,
        message_id: i64,
        content: &str,
        edited_at: Option<&str>,
    ) -> Result<EditResult, MessagingError> {
        let not_found = || MessagingError::NotFound(format!("message {message_id}"));
        let mut tx = self.store.begin().await?;

        if !store::lock_message(&mut tx, message_id).await? {
            return Err(not_found());
        }
        let message = store::get_message(&mut tx, message_id)
            .await?
            .ok_or_else(not_found)?;
        if message.sender.id != caller.id() {
            return Err(MessagingError::Forbidden(format!(
                "only the sender can edit message {message_id}"
            )));
        }

        let outcome = revisions::apply_edit(
            &mut tx,
            &ContentEdit {
                message_id,
                content,
                editor_id: Some(caller.id()),
                edited_at,
            },
        )
        .await?;
        let message = store::get_message(&mut tx, message_id)
            .await?
            .ok_or_else(not_found)?;
        tx.commit().await?;

        Ok(EditResult {
            message,
            revision_recorded: outcome.is_revised(),
        })
    }

    /// Mark a message addressed to the caller as read.
    ///
    /// Returns `true` if it was previously unread.
    ///
    /// # Errors
    ///
    /// [`MessagingError::NotFound`] for an unknown message and
    /// [`MessagingError::Forbidden`] when the caller is not the receiver.
    pub async fn mark_read(&self, caller: Caller, message_id: i64) -> Result<bool, MessagingError> {
        self.with_retry("mark_read", move || async move {
            let mut tx = self.store.begin().await?;
            let changed = unread::mark_read(&mut tx, message_id, caller.id()).await?;
            tx.commit().await?;
            Ok::<_, MessagingError>(changed)
        })
        .await
    }

    /// Mark one of the caller's notifications read.
    ///
    /// # Errors
    ///
    /// [`MessagingError::NotFound`] for an unknown notification and
    /// [`MessagingError::Forbidden`] when it belongs to someone else.
    pub async fn mark_notification_read(
        &self,
        caller: Caller,
        notification_id: i64,
    ) -> Result<bool, MessagingError> {
        self.with_retry("mark_notification_read", move || async move {
            let mut tx = self.store.begin().await?;
            let changed = notifications::mark_read(&mut tx, notification_id, caller.id()).await?;
            tx.commit().await?;
            Ok::<_, MessagingError>(changed)
        })
        .await
    }

    /// Permanently remove the caller's identity and everything it owns.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotFound`] if the identity is already gone.
    pub async fn delete_account(&self, caller: Caller) -> Result<RemovalReport, MessagingError> {
        self.with_retry("delete_account", move || async move {
            let mut tx = self.store.begin().await?;
            let report = retention::remove_identity(&mut tx, caller.id()).await?;
            tx.commit().await?;
            Ok::<_, MessagingError>(report)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The full thread containing `message_id`, starting at its root.
    ///
    /// The caller must be sender or receiver of the root or of the requested
    /// message. See [`thread`] for the consistency guarantees.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::NotFound`] for an unknown message.
    /// - [`MessagingError::Forbidden`] when the caller is not a participant.
    /// - [`MessagingError::ConsistencyViolation`] for a corrupted parent chain.
    pub async fn thread(&self, caller: Caller, message_id: i64) -> Result<ThreadNode, MessagingError> {
        let mut conn = self.store.acquire().await?;
        let requested = store::get_message(&mut conn, message_id)
            .await?
            .ok_or_else(|| MessagingError::NotFound(format!("message {message_id}")))?;
        let root = thread::ancestor_root(&mut conn, message_id).await?;
        if !root.involves(caller.id()) && !requested.involves(caller.id()) {
            return Err(MessagingError::Forbidden(format!(
                "identity {} is not part of the thread of message {message_id}",
                caller.id()
            )));
        }
        let tree = thread::build_tree(&mut conn, root.id).await?;
        debug!(message_id, root_id = root.id, nodes = tree.node_count(), "thread built");
        Ok(tree)
    }

    /// Root messages addressed to the caller, newest first, each with its
    /// direct replies (oldest first).
    pub async fn inbox(&self, caller: Caller) -> Result<Vec<InboxEntry>, MessagingError> {
        let mut conn = self.store.acquire().await?;
        let roots = store::list_inbox_roots(&mut conn, caller.id()).await?;
        let root_ids: Vec<i64> = roots.iter().map(|(message, _)| message.id).collect();

        let mut replies: HashMap<i64, Vec<Message>> = HashMap::new();
        for reply in store::list_by_parents(&mut conn, &root_ids).await? {
            if let Some(parent_id) = reply.parent_id {
                replies.entry(parent_id).or_default().push(reply);
            }
        }

        Ok(roots
            .into_iter()
            .map(|(message, reply_count)| {
                let replies = replies.remove(&message.id).unwrap_or_default();
                InboxEntry {
                    message,
                    reply_count,
                    replies,
                }
            })
            .collect())
    }

    /// Unread messages addressed to the caller, newest first.
    pub async fn unread_inbox(&self, caller: Caller) -> Result<Vec<Message>, MessagingError> {
        let mut conn = self.store.acquire().await?;
        unread::unread_for(&mut conn, caller.id()).await
    }

    /// Number of unread messages addressed to the caller.
    pub async fn unread_count(&self, caller: Caller) -> Result<u64, MessagingError> {
        let mut conn = self.store.acquire().await?;
        unread::unread_count(&mut conn, caller.id()).await
    }

    /// Edit history of a message, newest first.
    ///
    /// # Errors
    ///
    /// [`MessagingError::NotFound`] for an unknown message and
    /// [`MessagingError::Forbidden`] when the caller is not a participant.
    pub async fn history(
        &self,
        caller: Caller,
        message_id: i64,
    ) -> Result<Vec<Revision>, MessagingError> {
        let mut conn = self.store.acquire().await?;
        let message = store::get_message(&mut conn, message_id)
            .await?
            .ok_or_else(|| MessagingError::NotFound(format!("message {message_id}")))?;
        if !message.involves(caller.id()) {
            return Err(MessagingError::Forbidden(format!(
                "identity {} is not a participant of message {message_id}",
                caller.id()
            )));
        }
        revisions::history(&mut conn, message_id).await
    }

    /// The caller's notifications, newest first.
    pub async fn notifications(
        &self,
        caller: Caller,
        unread_only: bool,
    ) -> Result<Vec<Notification>, MessagingError> {
        let mut conn = self.store.acquire().await?;
        notifications::list_for(&mut conn, caller.id(), unread_only).await
    }

    /// Number of the caller's unread notifications.
    pub async fn unread_notification_count(&self, caller: Caller) -> Result<u64, MessagingError> {
        let mut conn = self.store.acquire().await?;
        notifications::unread_count(&mut conn, caller.id()).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn validate_content<'a>(&self, content: &'a str) -> Result<&'a str, MessagingError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(MessagingError::Validation(
                "content must not be empty".to_owned(),
            ));
        }
        if trimmed.len() > self.max_content_bytes {
            return Err(MessagingError::Validation(format!(
                "content is {} bytes, limit is {}",
                trimmed.len(),
                self.max_content_bytes
            )));
        }
        Ok(trimmed)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt limit is reached.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, MessagingError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(operation, attempt, error = %err, "transaction failed, retrying");
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) if err.is_retryable() => {
                    warn!(operation, attempt, error = %err, "transaction failed, giving up");
                    return Err(err);
                }
                result => return result,
            }
        }
    }
}
