//! Reply-tree reconstruction.
//!
//! A thread is stored flat: every message carries an optional `parent_id`.
//! Rebuilding it takes three steps:
//!
//! 1. [`ancestor_root`] walks `parent_id` links upward to the root.
//! 2. [`descendants`] fetches the subtree breadth-first, one query per depth
//!    level (not one per node).
//! 3. [`assemble_tree`] groups the flat list by parent and builds the nested
//!    [`ThreadNode`] bottom-up.
//!
//! Writes guarantee the parent graph is acyclic (a parent must exist before
//! its child). Traversal still keeps a visited set so corrupted data surfaces
//! as [`MessagingError::ConsistencyViolation`] instead of an endless loop.
//!
//! # Consistency
//!
//! Levels are fetched with separate queries outside any transaction, so a
//! reply committed after its level was read may be missing from the result.
//! Readers never block writers; callers that need the newest replies simply
//! rebuild the tree.

use std::collections::{HashMap, HashSet};

use sqlx::SqliteConnection;
use tracing::{trace, warn};

use super::model::{Message, ThreadNode};
use super::{store, MessagingError};

/// Walk the parent chain from `message_id` up to the thread root.
///
/// # Errors
///
/// - [`MessagingError::NotFound`] if `message_id` does not exist.
/// - [`MessagingError::ConsistencyViolation`] if the chain revisits a message
///   or references a parent that does not exist.
pub async fn ancestor_root(
    conn: &mut SqliteConnection,
    message_id: i64,
) -> Result<Message, MessagingError> {
    let mut current = store::get_message(conn, message_id)
        .await?
        .ok_or_else(|| MessagingError::NotFound(format!("message {message_id}")))?;
    let mut visited = HashSet::from([current.id]);

    while let Some(parent_id) = current.parent_id {
        if !visited.insert(parent_id) {
            return Err(MessagingError::ConsistencyViolation(format!(
                "cycle in parent chain of message {message_id} at message {parent_id}"
            )));
        }
        let child_id = current.id;
        current = store::get_message(conn, parent_id).await?.ok_or_else(|| {
            MessagingError::ConsistencyViolation(format!(
                "message {child_id} references missing parent {parent_id}"
            ))
        })?;
    }
    Ok(current)
}

/// Fetch every descendant of `root_id`, breadth-first.
///
/// The result is ordered level by level (children of the root first). A
/// message already seen is never queued again.
pub async fn descendants(
    conn: &mut SqliteConnection,
    root_id: i64,
) -> Result<Vec<Message>, MessagingError> {
    let mut seen = HashSet::from([root_id]);
    let mut frontier = vec![root_id];
    let mut collected = Vec::new();
    let mut depth: usize = 0;

    while !frontier.is_empty() {
        let level = store::list_by_parents(conn, &frontier).await?;
        let mut next = Vec::with_capacity(level.len());
        for message in level {
            if seen.insert(message.id) {
                next.push(message.id);
                collected.push(message);
            } else {
                warn!(root_id, message_id = message.id, "message reached twice while walking thread");
            }
        }
        depth = depth.saturating_add(1);
        frontier = next;
    }

    trace!(root_id, depth, count = collected.len(), "descendants fetched");
    Ok(collected)
}

/// Rebuild the full reply tree under `root_id`.
///
/// # Errors
///
/// Returns [`MessagingError::NotFound`] if `root_id` does not exist.
pub async fn build_tree(
    conn: &mut SqliteConnection,
    root_id: i64,
) -> Result<ThreadNode, MessagingError> {
    let root = store::get_message(conn, root_id)
        .await?
        .ok_or_else(|| MessagingError::NotFound(format!("message {root_id}")))?;
    let flat = descendants(conn, root_id).await?;
    Ok(assemble_tree(root, flat))
}

/// Nest a flat descendant list under `root`.
///
/// Messages are grouped by parent id; each group is ordered by creation time
/// (id breaks ties). Nodes are built deepest-first so every child list is
/// complete before its parent node is created. Messages whose parent is not
/// part of the tree are dropped.
pub fn assemble_tree(root: Message, flat: Vec<Message>) -> ThreadNode {
    let root_id = root.id;
    let mut members: HashSet<i64> = flat.iter().map(|m| m.id).collect();
    members.insert(root_id);

    let mut pending: HashMap<i64, Vec<Message>> = HashMap::new();
    for message in flat {
        match message.parent_id {
            Some(parent_id) if members.contains(&parent_id) && message.id != root_id => {
                pending.entry(parent_id).or_default().push(message);
            }
            _ => warn!(message_id = message.id, "dropping message detached from thread"),
        }
    }

    // Post-order walk without recursion: a node is finished once all of its
    // children have been pushed into `finished`.
    let mut finished: HashMap<i64, Vec<ThreadNode>> = HashMap::new();
    let mut stack: Vec<(Message, bool)> = pending
        .remove(&root_id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| (child, false))
        .collect();
    while let Some((message, expanded)) = stack.pop() {
        if !expanded {
            let children = pending.remove(&message.id).unwrap_or_default();
            stack.push((message, true));
            stack.extend(children.into_iter().map(|child| (child, false)));
            continue;
        }
        let parent_id = message.parent_id.unwrap_or(root_id);
        let mut node = ThreadNode::leaf(message);
        node.children = sorted(finished.remove(&node.id).unwrap_or_default());
        finished.entry(parent_id).or_default().push(node);
    }

    let mut tree = ThreadNode::leaf(root);
    tree.children = sorted(finished.remove(&root_id).unwrap_or_default());
    tree
}

fn sorted(mut nodes: Vec<ThreadNode>) -> Vec<ThreadNode> {
    nodes.sort_by(|a, b| (&a.created_at, a.id).cmp(&(&b.created_at, b.id)));
    nodes
}
