//! Threadline CLI entry point.
//!
//! Every subcommand opens the configured database, runs one operation and
//! prints the result as pretty JSON on stdout. Caller-scoped subcommands act
//! as the identity named by `--as`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use threadline::config::{self, Config};
use threadline::logging::{self, LoggingGuard};
use threadline::messaging::{
    Caller, EditMessage, MessageStore, MessagingError, MessagingService, SendMessage,
};

/// Threadline: threaded direct messages with edit history.
#[derive(Parser)]
#[command(name = "threadline", version, about)]
struct Cli {
    /// Config file (defaults to ~/.threadline/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file; overrides the config and THREADLINE_DB.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Username to act as.
    #[arg(long = "as", global = true, value_name = "USERNAME")]
    user: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the database and apply the schema.
    Init,
    /// Register a new identity.
    AddUser {
        /// Unique username.
        username: String,
    },
    /// Send a message.
    Send {
        /// Receiver username.
        to: String,
        /// Message body.
        content: String,
        /// Id of the message being replied to.
        #[arg(long)]
        reply_to: Option<i64>,
    },
    /// Edit a message you sent.
    Edit {
        /// Message id.
        message_id: i64,
        /// Replacement body.
        content: String,
        /// Explicit edit time (RFC 3339).
        #[arg(long)]
        edited_at: Option<String>,
    },
    /// Show the full thread containing a message.
    Thread {
        /// Any message id in the thread.
        message_id: i64,
    },
    /// List top-level messages addressed to you.
    Inbox,
    /// List unread messages addressed to you.
    Unread {
        /// Print only the number of unread messages.
        #[arg(long)]
        count: bool,
    },
    /// Mark a message addressed to you as read.
    Read {
        /// Message id.
        message_id: i64,
    },
    /// Show the edit history of a message.
    History {
        /// Message id.
        message_id: i64,
    },
    /// List your notifications, or mark one read.
    Notifications {
        /// Only unread notifications.
        #[arg(long)]
        unread: bool,
        /// Mark this notification read instead of listing.
        #[arg(long)]
        mark_read: Option<i64>,
    },
    /// Permanently delete your identity and everything it owns.
    DeleteAccount {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => config::load_default_config()?,
    };
    let _logging_guard = init_logging(&config)?;

    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => config::database_path(&config.database)?,
    };
    debug!(db = %db_path.display(), "opening database");
    let store = MessageStore::open(&db_path, &config.database)
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let service = MessagingService::from_config(store.clone(), &config);

    let result = dispatch(&service, cli.user.as_deref(), cli.command, &db_path).await;
    store.close().await;
    result
}

async fn dispatch(
    service: &MessagingService,
    user: Option<&str>,
    command: Command,
    db_path: &std::path::Path,
) -> anyhow::Result<()> {
    match command {
        Command::Init => print_json(&serde_json::json!({ "database": db_path.display().to_string() })),
        Command::AddUser { username } => print_json(&service.create_identity(&username).await?),
        Command::Send {
            to,
            content,
            reply_to,
        } => {
            let caller = resolve_caller(service, user).await?;
            let receiver = service.identity_by_name(&to).await?.ok_or_else(|| {
                MessagingError::Validation(format!("receiver {to:?} does not exist"))
            })?;
            let request = SendMessage {
                receiver_id: receiver.id,
                content,
                parent_id: reply_to,
            };
            print_json(&service.send_message(caller, &request).await?)
        }
        Command::Edit {
            message_id,
            content,
            edited_at,
        } => {
            let caller = resolve_caller(service, user).await?;
            let request = EditMessage {
                message_id,
                content,
                edited_at,
            };
            print_json(&service.edit_message(caller, &request).await?)
        }
        Command::Thread { message_id } => {
            let caller = resolve_caller(service, user).await?;
            print_json(&service.thread(caller, message_id).await?)
        }
        Command::Inbox => {
            let caller = resolve_caller(service, user).await?;
            print_json(&service.inbox(caller).await?)
        }
        Command::Unread { count } => {
            let caller = resolve_caller(service, user).await?;
            if count {
                print_json(&serde_json::json!({ "unread": service.unread_count(caller).await? }))
            } else {
                print_json(&service.unread_inbox(caller).await?)
            }
        }
        Command::Read { message_id } => {
            let caller = resolve_caller(service, user).await?;
            let changed = service.mark_read(caller, message_id).await?;
            print_json(&serde_json::json!({ "message_id": message_id, "changed": changed }))
        }
        Command::History { message_id } => {
            let caller = resolve_caller(service, user).await?;
            print_json(&service.history(caller, message_id).await?)
        }
        Command::Notifications { unread, mark_read } => {
            let caller = resolve_caller(service, user).await?;
            match mark_read {
                Some(id) => {
                    let changed = service.mark_notification_read(caller, id).await?;
                    print_json(&serde_json::json!({ "notification_id": id, "changed": changed }))
                }
                None => print_json(&service.notifications(caller, unread).await?),
            }
        }
        Command::DeleteAccount { yes } => {
            if !yes {
                anyhow::bail!("refusing to delete without --yes");
            }
            let caller = resolve_caller(service, user).await?;
            print_json(&service.delete_account(caller).await?)
        }
    }
}

/// Map `--as <username>` to an authenticated caller.
async fn resolve_caller(
    service: &MessagingService,
    user: Option<&str>,
) -> anyhow::Result<Caller> {
    let username = user.context("this command needs --as <USERNAME>")?;
    let identity = service
        .identity_by_name(username)
        .await?
        .ok_or_else(|| MessagingError::NotFound(format!("identity {username:?}")))?;
    Ok(Caller::authenticated(identity.id))
}

fn init_logging(config: &Config) -> anyhow::Result<Option<LoggingGuard>> {
    match &config.logging.dir {
        Some(dir) => Ok(Some(logging::init_file(dir, &config.logging.level)?)),
        None => {
            logging::init_cli(&config.logging.level);
            Ok(None)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

/// Print a failure on stderr, as a JSON error object when it carries a code.
fn report(err: &anyhow::Error) {
    match err.downcast_ref::<MessagingError>() {
        Some(messaging) => {
            let body = serde_json::json!({
                "error": {
                    "code": messaging.code(),
                    "message": messaging.to_string(),
                }
            });
            eprintln!("{body}");
        }
        None => eprintln!("error: {err:#}"),
    }
}
