//! SQLite-backed message store.
//!
//! [`MessageStore`] owns the connection pool and schema. The free functions in
//! this module are the record-store contract used by the components: single
//! message CRUD, listing by parent and by receiver, and identity lookups. They
//! all take a `&mut SqliteConnection` so the same call works on a pooled
//! connection (read paths) or inside an open transaction (write paths).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{info, trace};

use super::model::{now_timestamp, Identity, Message, Participant};
use super::MessagingError;
use crate::config::DatabaseConfig;

/// Maximum number of parent ids bound into one `IN (...)` list.
const PARENT_BATCH: usize = 500;

const MESSAGE_COLUMNS: &str = "m.id, m.sender_id, s.username, m.receiver_id, r.username, \
     m.parent_id, m.content, m.created_at, m.edited, m.edited_at, m.editor_id, m.read";

const MESSAGE_FROM: &str = "FROM messages m \
     JOIN identities s ON s.id = m.sender_id \
     JOIN identities r ON r.id = m.receiver_id";

/// Row type returned by message queries (see [`MESSAGE_COLUMNS`]).
type MessageRow = (
    i64,
    i64,
    String,
    i64,
    String,
    Option<i64>,
    String,
    String,
    i64,
    Option<String>,
    Option<i64>,
    i64,
);

/// Message row followed by its direct reply count.
type InboxRow = (
    i64,
    i64,
    String,
    i64,
    String,
    Option<i64>,
    String,
    String,
    i64,
    Option<String>,
    Option<i64>,
    i64,
    i64,
);

/// Handle to the messaging database.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open (or create) the database at `path` and apply migrations.
    ///
    /// Enables WAL journaling and foreign keys; cascading deletes depend on
    /// the latter.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database cannot
    /// be opened, or a migration fails.
    pub async fn open(path: &Path, config: &DatabaseConfig) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .pragma("trusted_schema", "OFF")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open message store at {}", path.display()))?;

        apply_migrations(&pool)
            .await
            .context("failed to apply messaging schema migrations")?;

        info!(path = %path.display(), max_connections = config.max_connections, "message store opened");
        Ok(Self { pool })
    }

    /// Open a private in-memory store with the schema applied.
    ///
    /// In-memory databases are per-connection, so the pool holds exactly one.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot connect or a migration fails.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("in-memory pool should connect")?;
        apply_migrations(&pool)
            .await
            .context("failed to apply messaging schema migrations")?;
        Ok(Self { pool })
    }

    /// Begin a transaction for one logical write.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::TransactionFailure`] when no connection is
    /// available in time.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, MessagingError> {
        Ok(self.pool.begin().await?)
    }

    /// Check out a connection for a read path.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::TransactionFailure`] when the pool is exhausted.
    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>, MessagingError> {
        Ok(self.pool.acquire().await?)
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all pooled connections.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("message store closed");
    }
}

/// Apply the embedded schema migrations. Safe to run repeatedly.
///
/// # Errors
///
/// Returns the underlying SQLite error if a statement fails.
pub async fn apply_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_str!("../../migrations/001_schema.sql"))
        .execute(pool)
        .await?;
    sqlx::raw_sql(include_str!("../../migrations/002_messaging.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Register a new identity.
///
/// # Errors
///
/// Returns [`MessagingError::Validation`] if the username is blank or taken.
pub async fn create_identity(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Identity, MessagingError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(MessagingError::Validation("username must not be empty".to_owned()));
    }
    let created_at = now_timestamp();
    let result = sqlx::query("INSERT INTO identities (username, created_at) VALUES (?1, ?2)")
        .bind(username)
        .bind(&created_at)
        .execute(&mut *conn)
        .await;
    let id = match result {
        Ok(done) => done.last_insert_rowid(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(MessagingError::Validation(format!(
                "username {username:?} is already taken"
            )));
        }
        Err(err) => return Err(err.into()),
    };
    trace!(identity_id = id, username, "identity row inserted");
    Ok(Identity {
        id,
        username: username.to_owned(),
        created_at,
    })
}

/// Load an identity by id.
pub async fn find_identity(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Identity>, MessagingError> {
    let row: Option<(i64, String, String)> =
        sqlx::query_as("SELECT id, username, created_at FROM identities WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|(id, username, created_at)| Identity {
        id,
        username,
        created_at,
    }))
}

/// Load an identity by username.
pub async fn identity_by_name(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Option<Identity>, MessagingError> {
    let row: Option<(i64, String, String)> =
        sqlx::query_as("SELECT id, username, created_at FROM identities WHERE username = ?1")
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|(id, username, created_at)| Identity {
        id,
        username,
        created_at,
    }))
}

/// Take the write lock via a no-op update on an identity row.
///
/// Returns `false` if the identity does not exist.
pub async fn lock_identity(conn: &mut SqliteConnection, id: i64) -> Result<bool, MessagingError> {
    let done = sqlx::query("UPDATE identities SET username = username WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Fields of a message about to be inserted.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    /// Sending identity.
    pub sender_id: i64,
    /// Receiving identity.
    pub receiver_id: i64,
    /// Parent message, already verified to exist.
    pub parent_id: Option<i64>,
    /// Message body.
    pub content: &'a str,
    /// Creation timestamp.
    pub created_at: &'a str,
}

/// Take the write lock via a no-op update on a message row.
///
/// Must be the first statement of a read-modify-write transaction so the
/// subsequent read sees the latest committed content. Returns `false` if the
/// message does not exist.
pub async fn lock_message(conn: &mut SqliteConnection, id: i64) -> Result<bool, MessagingError> {
    let done = sqlx::query("UPDATE messages SET content = content WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Insert a message row and return its id.
pub async fn insert_message(
    conn: &mut SqliteConnection,
    message: &NewMessage<'_>,
) -> Result<i64, MessagingError> {
    let done = sqlx::query(
        "INSERT INTO messages (sender_id, receiver_id, parent_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(message.sender_id)
    .bind(message.receiver_id)
    .bind(message.parent_id)
    .bind(message.content)
    .bind(message.created_at)
    .execute(&mut *conn)
    .await?;
    let id = done.last_insert_rowid();
    trace!(message_id = id, parent_id = ?message.parent_id, "message inserted");
    Ok(id)
}

/// Load a message with sender and receiver resolved.
pub async fn get_message(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Message>, MessagingError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} {MESSAGE_FROM} WHERE m.id = ?1");
    let row: Option<MessageRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(message_from_row))
}

/// Read only the persisted content of a message.
pub async fn current_content(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<String>, MessagingError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT content FROM messages WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(content,)| content))
}

/// Replace a message's content and mark it edited.
pub async fn overwrite_content(
    conn: &mut SqliteConnection,
    id: i64,
    content: &str,
    edited_at: &str,
    editor_id: Option<i64>,
) -> Result<(), MessagingError> {
    sqlx::query(
        "UPDATE messages SET content = ?1, edited = 1, edited_at = ?2, editor_id = ?3 \
         WHERE id = ?4",
    )
    .bind(content)
    .bind(edited_at)
    .bind(editor_id)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Set the read flag. Returns `true` if the flag changed.
pub async fn set_read(
    conn: &mut SqliteConnection,
    id: i64,
    read: bool,
) -> Result<bool, MessagingError> {
    let done = sqlx::query("UPDATE messages SET read = ?1 WHERE id = ?2 AND read != ?1")
        .bind(read)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Delete a single message. Its replies, revisions and notification cascade.
pub async fn delete_message(conn: &mut SqliteConnection, id: i64) -> Result<bool, MessagingError> {
    let done = sqlx::query("DELETE FROM messages WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// List every message whose parent is in `parent_ids`, oldest first.
pub async fn list_by_parents(
    conn: &mut SqliteConnection,
    parent_ids: &[i64],
) -> Result<Vec<Message>, MessagingError> {
    let mut messages = Vec::new();
    for batch in parent_ids.chunks(PARENT_BATCH) {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} {MESSAGE_FROM} WHERE m.parent_id IN ("
        ));
        let mut ids = query.separated(", ");
        for id in batch {
            ids.push_bind(*id);
        }
        ids.push_unseparated(") ORDER BY m.created_at ASC, m.id ASC");
        let rows = query
            .build_query_as::<MessageRow>()
            .fetch_all(&mut *conn)
            .await?;
        messages.extend(rows.into_iter().map(message_from_row));
    }
    Ok(messages)
}

/// List messages addressed to `receiver_id` with the given read flag, newest first.
pub async fn list_by_receiver(
    conn: &mut SqliteConnection,
    receiver_id: i64,
    read: bool,
) -> Result<Vec<Message>, MessagingError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} {MESSAGE_FROM} \
         WHERE m.receiver_id = ?1 AND m.read = ?2 \
         ORDER BY m.created_at DESC, m.id DESC"
    );
    let rows: Vec<MessageRow> = sqlx::query_as(&sql)
        .bind(receiver_id)
        .bind(read)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(message_from_row).collect())
}

/// Count messages addressed to `receiver_id` with the given read flag.
pub async fn count_by_receiver(
    conn: &mut SqliteConnection,
    receiver_id: i64,
    read: bool,
) -> Result<u64, MessagingError> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM messages WHERE receiver_id = ?1 AND read = ?2")
            .bind(receiver_id)
            .bind(read)
            .fetch_one(&mut *conn)
            .await?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// List root messages addressed to `receiver_id` with their direct reply count,
/// newest first.
pub async fn list_inbox_roots(
    conn: &mut SqliteConnection,
    receiver_id: i64,
) -> Result<Vec<(Message, u64)>, MessagingError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}, \
         (SELECT count(*) FROM messages c WHERE c.parent_id = m.id) \
         {MESSAGE_FROM} \
         WHERE m.receiver_id = ?1 AND m.parent_id IS NULL \
         ORDER BY m.created_at DESC, m.id DESC"
    );
    let rows: Vec<InboxRow> = sqlx::query_as(&sql)
        .bind(receiver_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let (
                id,
                sender_id,
                sender_name,
                receiver_id,
                receiver_name,
                parent_id,
                content,
                created_at,
                edited,
                edited_at,
                editor_id,
                read,
                reply_count,
            ) = row;
            let message = message_from_row((
                id,
                sender_id,
                sender_name,
                receiver_id,
                receiver_name,
                parent_id,
                content,
                created_at,
                edited,
                edited_at,
                editor_id,
                read,
            ));
            (message, u64::try_from(reply_count).unwrap_or_default())
        })
        .collect())
}

/// Convert a raw message row tuple into a [`Message`].
fn message_from_row(row: MessageRow) -> Message {
    let (
        id,
        sender_id,
        sender_name,
        receiver_id,
        receiver_name,
        parent_id,
        content,
        created_at,
        edited,
        edited_at,
        editor_id,
        read,
    ) = row;
    Message {
        id,
        sender: Participant {
            id: sender_id,
            username: sender_name,
        },
        receiver: Participant {
            id: receiver_id,
            username: receiver_name,
        },
        parent_id,
        content,
        created_at,
        edited: edited != 0,
        edited_at,
        editor_id,
        read: read != 0,
    }
}
