//! Notification dispatch and the per-recipient notification inbox.

use sqlx::SqliteConnection;
use tracing::trace;

use super::model::{now_timestamp, Message, Notification};
use super::MessagingError;

/// Row type returned by SQLite queries for notifications.
type NotificationRow = (i64, i64, i64, i64, String);

const NOTIFICATION_COLUMNS: &str = "id, recipient_id, message_id, is_read, created_at";

/// Create the single notification for a freshly inserted message.
///
/// Call exactly once, on the transaction that inserted `message`, so the
/// message and its notification commit together. The `UNIQUE(message_id)`
/// constraint rejects a second dispatch for the same message.
///
/// # Errors
///
/// Returns [`MessagingError::ConsistencyViolation`] if a notification already
/// exists for the message.
pub async fn dispatch(
    conn: &mut SqliteConnection,
    message: &Message,
) -> Result<Notification, MessagingError> {
    let created_at = now_timestamp();
    let result = sqlx::query(
        "INSERT INTO notifications (recipient_id, message_id, is_read, created_at) \
         VALUES (?1, ?2, 0, ?3)",
    )
    .bind(message.receiver.id)
    .bind(message.id)
    .bind(&created_at)
    .execute(&mut *conn)
    .await;
    let id = match result {
        Ok(done) => done.last_insert_rowid(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(MessagingError::ConsistencyViolation(format!(
                "message {} already has a notification",
                message.id
            )));
        }
        Err(err) => return Err(err.into()),
    };
    trace!(
        notification_id = id,
        message_id = message.id,
        recipient_id = message.receiver.id,
        "notification dispatched"
    );
    Ok(Notification {
        id,
        recipient_id: message.receiver.id,
        message_id: message.id,
        is_read: false,
        created_at,
    })
}

/// List a recipient's notifications, newest first.
pub async fn list_for(
    conn: &mut SqliteConnection,
    recipient_id: i64,
    unread_only: bool,
) -> Result<Vec<Notification>, MessagingError> {
    let filter = if unread_only { " AND is_read = 0" } else { "" };
    let sql = format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
         WHERE recipient_id = ?1{filter} \
         ORDER BY created_at DESC, id DESC"
    );
    let rows: Vec<NotificationRow> = sqlx::query_as(&sql)
        .bind(recipient_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(notification_from_row).collect())
}

/// Load a notification by id.
pub async fn get(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Notification>, MessagingError> {
    let sql = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?1");
    let row: Option<NotificationRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(notification_from_row))
}

/// Mark a notification read on behalf of its recipient.
///
/// Returns `true` if the flag changed.
///
/// # Errors
///
/// Returns [`MessagingError::NotFound`] for an unknown id and
/// [`MessagingError::Forbidden`] when `recipient_id` does not own it.
pub async fn mark_read(
    conn: &mut SqliteConnection,
    id: i64,
    recipient_id: i64,
) -> Result<bool, MessagingError> {
    let notification = get(conn, id)
        .await?
        .ok_or_else(|| MessagingError::NotFound(format!("notification {id}")))?;
    if notification.recipient_id != recipient_id {
        return Err(MessagingError::Forbidden(format!(
            "notification {id} belongs to another identity"
        )));
    }
    let done = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ?1 AND is_read = 0")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Count a recipient's unread notifications.
pub async fn unread_count(
    conn: &mut SqliteConnection,
    recipient_id: i64,
) -> Result<u64, MessagingError> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT count(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
    )
    .bind(recipient_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Count the notifications attached to a message (zero or one).
pub async fn count_for_message(
    conn: &mut SqliteConnection,
    message_id: i64,
) -> Result<u64, MessagingError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM notifications WHERE message_id = ?1")
            .bind(message_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}

fn notification_from_row(row: NotificationRow) -> Notification {
    let (id, recipient_id, message_id, is_read, created_at) = row;
    Notification {
        id,
        recipient_id,
        message_id,
        is_read: is_read != 0,
        created_at,
    }
}
