//! Revision tracking for message edits.
//!
//! [`apply_edit`] is the only way message content changes after creation. It
//! runs on the caller's transaction, locks the message row, compares the
//! persisted content with the new content and, only when they differ, records
//! a [`Revision`] holding the old content before overwriting it.

use sqlx::SqliteConnection;
use tracing::{debug, trace};

use super::model::{now_timestamp, Revision};
use super::{store, MessagingError};

/// A requested content change to an existing message.
#[derive(Debug, Clone)]
pub struct ContentEdit<'a> {
    /// Message being edited.
    pub message_id: i64,
    /// Replacement content.
    pub content: &'a str,
    /// Who is editing, if known.
    pub editor_id: Option<i64>,
    /// Explicit edit time for this write; defaults to now.
    pub edited_at: Option<&'a str>,
}

/// Result of [`apply_edit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Content was identical; nothing was written.
    Unchanged,
    /// Content changed and the prior value was captured.
    Revised {
        /// Id of the new revision row.
        revision_id: i64,
    },
}

impl EditOutcome {
    /// Whether a revision was recorded.
    pub fn is_revised(&self) -> bool {
        matches!(self, Self::Revised { .. })
    }
}

/// Apply a content edit with diff-before-write versioning.
///
/// Must run inside the transaction that commits the edit. The row lock is
/// taken before the prior content is read, so concurrent edits of the same
/// message each snapshot the value current at their own commit point.
///
/// # Errors
///
/// Returns [`MessagingError::NotFound`] if the message does not exist.
pub async fn apply_edit(
    conn: &mut SqliteConnection,
    edit: &ContentEdit<'_>,
) -> Result<EditOutcome, MessagingError> {
    let not_found = || MessagingError::NotFound(format!("message {}", edit.message_id));

    if !store::lock_message(conn, edit.message_id).await? {
        return Err(not_found());
    }
    let persisted = store::current_content(conn, edit.message_id)
        .await?
        .ok_or_else(not_found)?;

    if persisted == edit.content {
        trace!(message_id = edit.message_id, "content unchanged, no revision");
        return Ok(EditOutcome::Unchanged);
    }

    let captured_at = now_timestamp();
    let revision_id =
        insert_revision(conn, edit.message_id, &persisted, &captured_at, edit.editor_id).await?;
    let edited_at = edit.edited_at.unwrap_or(&captured_at);
    store::overwrite_content(conn, edit.message_id, edit.content, edited_at, edit.editor_id)
        .await?;

    debug!(
        message_id = edit.message_id,
        revision_id,
        editor_id = ?edit.editor_id,
        "message revised"
    );
    Ok(EditOutcome::Revised { revision_id })
}

async fn insert_revision(
    conn: &mut SqliteConnection,
    message_id: i64,
    old_content: &str,
    captured_at: &str,
    editor_id: Option<i64>,
) -> Result<i64, MessagingError> {
    let done = sqlx::query(
        "INSERT INTO revisions (message_id, old_content, captured_at, editor_id) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(message_id)
    .bind(old_content)
    .bind(captured_at)
    .bind(editor_id)
    .execute(&mut *conn)
    .await?;
    Ok(done.last_insert_rowid())
}

/// List the revisions of a message, newest first.
pub async fn history(
    conn: &mut SqliteConnection,
    message_id: i64,
) -> Result<Vec<Revision>, MessagingError> {
    let rows: Vec<(i64, i64, String, String, Option<i64>)> = sqlx::query_as(
        "SELECT id, message_id, old_content, captured_at, editor_id \
         FROM revisions WHERE message_id = ?1 \
         ORDER BY captured_at DESC, id DESC",
    )
    .bind(message_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, message_id, old_content, captured_at, editor_id)| Revision {
            id,
            message_id,
            old_content,
            captured_at,
            editor_id,
        })
        .collect())
}

/// Count the revisions recorded for a message.
pub async fn count_for_message(
    conn: &mut SqliteConnection,
    message_id: i64,
) -> Result<u64, MessagingError> {
    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM revisions WHERE message_id = ?1")
        .bind(message_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}
