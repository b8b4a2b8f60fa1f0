//! Unread-message index.
//!
//! Queries never change read state. Marking a message read is the separate,
//! explicit [`mark_read`] call.

use sqlx::SqliteConnection;
use tracing::debug;

use super::model::Message;
use super::{store, MessagingError};

/// Unread messages addressed to `user_id`, newest first.
pub async fn unread_for(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<Message>, MessagingError> {
    store::list_by_receiver(conn, user_id, false).await
}

/// Number of unread messages addressed to `user_id`.
pub async fn unread_count(conn: &mut SqliteConnection, user_id: i64) -> Result<u64, MessagingError> {
    store::count_by_receiver(conn, user_id, false).await
}

/// Mark a message read on behalf of its receiver.
///
/// Returns `true` if the message was previously unread.
///
/// # Errors
///
/// Returns [`MessagingError::NotFound`] for an unknown message and
/// [`MessagingError::Forbidden`] when `reader_id` is not the receiver.
pub async fn mark_read(
    conn: &mut SqliteConnection,
    message_id: i64,
    reader_id: i64,
) -> Result<bool, MessagingError> {
    let message = store::get_message(conn, message_id)
        .await?
        .ok_or_else(|| MessagingError::NotFound(format!("message {message_id}")))?;
    if message.receiver.id != reader_id {
        return Err(MessagingError::Forbidden(format!(
            "only the receiver can mark message {message_id} read"
        )));
    }
    let changed = store::set_read(conn, message_id, true).await?;
    debug!(message_id, reader_id, changed, "message marked read");
    Ok(changed)
}
