//! Account removal.
//!
//! Deleting an identity cascades through the schema: messages it sent or
//! received go, and with them their notifications, revisions and whole reply
//! subtrees. Revisions the identity authored on messages owned by others are
//! only weakly linked (`editor_id ON DELETE SET NULL`), so they are purged
//! explicitly before the identity row is removed.

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::info;

use super::MessagingError;

/// Row counts removed by [`remove_identity`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    /// Identity that was removed.
    pub identity_id: i64,
    /// Messages removed, including replies by other identities.
    pub messages: u64,
    /// Notifications removed.
    pub notifications: u64,
    /// Revisions removed, cascaded and explicitly purged.
    pub revisions: u64,
}

/// Remove an identity and everything that depends on it.
///
/// Must run inside a transaction; a failure at any step leaves nothing
/// removed once the caller rolls back.
///
/// # Errors
///
/// Returns [`MessagingError::NotFound`] if the identity does not exist.
pub async fn remove_identity(
    conn: &mut SqliteConnection,
    identity_id: i64,
) -> Result<RemovalReport, MessagingError> {
    // First statement is a write so the transaction holds the lock from here on.
    let purged = sqlx::query("DELETE FROM revisions WHERE editor_id = ?1")
        .bind(identity_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM identities WHERE id = ?1")
        .bind(identity_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(MessagingError::NotFound(format!("identity {identity_id}")));
    }

    let cascade = Cascade::count(conn, identity_id).await?;
    sqlx::query("DELETE FROM identities WHERE id = ?1")
        .bind(identity_id)
        .execute(&mut *conn)
        .await?;

    let report = RemovalReport {
        identity_id,
        messages: cascade.messages,
        notifications: cascade.notifications,
        revisions: cascade.revisions.saturating_add(purged),
    };
    info!(
        identity_id,
        messages = report.messages,
        notifications = report.notifications,
        revisions = report.revisions,
        "identity removed"
    );
    Ok(report)
}

/// Rows the identity delete is about to cascade through.
#[derive(Debug, Clone, Copy)]
struct Cascade {
    messages: u64,
    notifications: u64,
    revisions: u64,
}

impl Cascade {
    /// Walks the identity's messages and their reply subtrees only.
    async fn count(conn: &mut SqliteConnection, identity_id: i64) -> Result<Self, MessagingError> {
        let (messages, notifications, revisions): (i64, i64, i64) = sqlx::query_as(
            "WITH RECURSIVE doomed(id) AS ( \
                 SELECT id FROM messages WHERE sender_id = ?1 OR receiver_id = ?1 \
                 UNION \
                 SELECT m.id FROM messages m JOIN doomed d ON m.parent_id = d.id \
             ) \
             SELECT (SELECT count(*) FROM doomed), \
                    (SELECT count(*) FROM notifications \
                      WHERE recipient_id = ?1 OR message_id IN (SELECT id FROM doomed)), \
                    (SELECT count(*) FROM revisions \
                      WHERE message_id IN (SELECT id FROM doomed))",
        )
        .bind(identity_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(Self {
            messages: u64::try_from(messages).unwrap_or_default(),
            notifications: u64::try_from(notifications).unwrap_or_default(),
            revisions: u64::try_from(revisions).unwrap_or_default(),
        })
    }
}
