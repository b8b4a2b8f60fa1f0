//! Thread reconstruction, authorization and cycle guards.

use threadline::messaging::{store, thread, ErrorCode, MessagingError};

use crate::support::{fixture, send};

#[tokio::test]
async fn tree_children_are_ordered_and_complete() {
    let fx = fixture().await;
    let root = send(&fx.service, fx.alice, fx.bob, "R", None).await;
    let c1 = send(&fx.service, fx.bob, fx.alice, "C1", Some(root.id)).await;
    let c2 = send(&fx.service, fx.alice, fx.bob, "C2", Some(root.id)).await;
    let c3 = send(&fx.service, fx.alice, fx.bob, "C3", Some(c1.id)).await;

    let tree = fx.service.thread(fx.alice, root.id).await.expect("thread");
    assert_eq!(tree.id, root.id);
    assert_eq!(tree.node_count(), 4);

    let children: Vec<i64> = tree.children.iter().map(|c| c.id).collect();
    assert_eq!(children, vec![c1.id, c2.id]);
    assert_eq!(tree.children[0].children.len(), 1);
    assert_eq!(tree.children[0].children[0].id, c3.id);
    assert!(tree.children[1].children.is_empty());
    assert_eq!(tree.children[0].sender.username, "bob");
}

#[tokio::test]
async fn any_message_resolves_to_the_whole_thread() {
    let fx = fixture().await;
    let root = send(&fx.service, fx.alice, fx.bob, "R", None).await;
    let c1 = send(&fx.service, fx.bob, fx.alice, "C1", Some(root.id)).await;
    let c3 = send(&fx.service, fx.alice, fx.bob, "C3", Some(c1.id)).await;

    let tree = fx.service.thread(fx.bob, c3.id).await.expect("thread");
    assert_eq!(tree.id, root.id);
    assert_eq!(tree.node_count(), 3);
}

#[tokio::test]
async fn edited_flag_appears_in_tree() {
    let fx = fixture().await;
    let root = send(&fx.service, fx.alice, fx.bob, "R", None).await;
    fx.service
        .edit_message(
            fx.alice,
            &threadline::messaging::EditMessage {
                message_id: root.id,
                content: "R2".to_owned(),
                edited_at: None,
            },
        )
        .await
        .expect("edit");

    let tree = fx.service.thread(fx.bob, root.id).await.expect("thread");
    assert!(tree.edited);
    assert_eq!(tree.content, "R2");
}

#[tokio::test]
async fn outsiders_are_forbidden() {
    let fx = fixture().await;
    let root = send(&fx.service, fx.alice, fx.bob, "R", None).await;

    let err = fx
        .service
        .thread(fx.carol, root.id)
        .await
        .expect_err("carol is not a participant");
    assert_eq!(err.code(), ErrorCode::Forbidden);
}

#[tokio::test]
async fn participant_of_requested_message_may_view_thread() {
    let fx = fixture().await;
    let root = send(&fx.service, fx.alice, fx.bob, "R", None).await;
    let looped_in = send(&fx.service, fx.bob, fx.carol, "cc carol", Some(root.id)).await;

    let tree = fx
        .service
        .thread(fx.carol, looped_in.id)
        .await
        .expect("carol receives the reply");
    assert_eq!(tree.id, root.id);

    let err = fx
        .service
        .thread(fx.carol, root.id)
        .await
        .expect_err("carol is not on the root");
    assert_eq!(err.code(), ErrorCode::Forbidden);
}

#[tokio::test]
async fn unknown_message_is_not_found() {
    let fx = fixture().await;
    let err = fx
        .service
        .thread(fx.alice, 12_345)
        .await
        .expect_err("missing message");
    assert_eq!(err.code(), ErrorCode::NotFound);

    let mut conn = fx.service.store().acquire().await.expect("connection");
    let err = thread::build_tree(&mut conn, 12_345)
        .await
        .expect_err("missing root");
    assert!(matches!(err, MessagingError::NotFound(_)));
}

/// Insert rows that bypass the write-time parent checks.
async fn insert_raw(
    conn: &mut sqlx::SqliteConnection,
    id: i64,
    parent_id: i64,
    sender_id: i64,
    receiver_id: i64,
) {
    sqlx::query(
        "INSERT INTO messages (id, sender_id, receiver_id, parent_id, content, created_at) \
         VALUES (?1, ?2, ?3, ?4, 'corrupt', '2024-01-01T00:00:00.000000Z')",
    )
    .bind(id)
    .bind(sender_id)
    .bind(receiver_id)
    .bind(parent_id)
    .execute(&mut *conn)
    .await
    .expect("raw insert");
}

#[tokio::test]
async fn parent_cycle_is_a_consistency_violation() {
    let fx = fixture().await;
    {
        let mut conn = fx.service.store().acquire().await.expect("connection");
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await
            .expect("pragma");
        insert_raw(&mut conn, 100, 101, fx.alice.id(), fx.bob.id()).await;
        insert_raw(&mut conn, 101, 100, fx.bob.id(), fx.alice.id()).await;

        let err = thread::ancestor_root(&mut conn, 100)
            .await
            .expect_err("cycle must be detected");
        assert!(matches!(err, MessagingError::ConsistencyViolation(_)));

        let below = thread::descendants(&mut conn, 100).await.expect("descendants");
        let ids: Vec<i64> = below.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![101]);
    }

    let err = fx
        .service
        .thread(fx.alice, 101)
        .await
        .expect_err("cycle surfaces through the service");
    assert_eq!(err.code(), ErrorCode::ConsistencyViolation);
}

#[tokio::test]
async fn dangling_parent_is_a_consistency_violation() {
    let fx = fixture().await;
    let mut conn = fx.service.store().acquire().await.expect("connection");
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await
        .expect("pragma");
    insert_raw(&mut conn, 200, 999, fx.alice.id(), fx.bob.id()).await;

    let err = thread::ancestor_root(&mut conn, 200)
        .await
        .expect_err("missing ancestor");
    assert!(matches!(err, MessagingError::ConsistencyViolation(_)));
}

#[tokio::test]
async fn descendants_fetch_level_by_level() {
    let fx = fixture().await;
    let root = send(&fx.service, fx.alice, fx.bob, "R", None).await;
    let a = send(&fx.service, fx.bob, fx.alice, "a", Some(root.id)).await;
    let b = send(&fx.service, fx.bob, fx.alice, "b", Some(root.id)).await;
    let a1 = send(&fx.service, fx.alice, fx.bob, "a1", Some(a.id)).await;
    let b1 = send(&fx.service, fx.alice, fx.bob, "b1", Some(b.id)).await;

    let mut conn = fx.service.store().acquire().await.expect("connection");
    let flat = thread::descendants(&mut conn, root.id).await.expect("descendants");
    let ids: Vec<i64> = flat.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![a.id, b.id, a1.id, b1.id]);

    let root_again = thread::ancestor_root(&mut conn, b1.id).await.expect("root");
    assert_eq!(root_again.id, root.id);
    let direct = store::list_by_parents(&mut conn, &[a.id, b.id]).await.expect("list");
    assert_eq!(direct.len(), 2);
}
