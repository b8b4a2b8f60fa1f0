//! Unread index: scoping, ordering and explicit read marking.

use threadline::messaging::ErrorCode;

use crate::support::{fixture, send};

#[tokio::test]
async fn unread_lists_only_messages_addressed_to_the_user() {
    let fx = fixture().await;
    let to_bob_1 = send(&fx.service, fx.alice, fx.bob, "first", None).await;
    let to_bob_2 = send(&fx.service, fx.carol, fx.bob, "second", None).await;
    send(&fx.service, fx.bob, fx.alice, "bob writes", None).await;
    send(&fx.service, fx.alice, fx.carol, "not for bob", None).await;

    let unread = fx.service.unread_inbox(fx.bob).await.expect("unread");
    let ids: Vec<i64> = unread.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![to_bob_2.id, to_bob_1.id]);
    assert!(unread.iter().all(|m| m.receiver.id == fx.bob.id() && !m.read));
    assert_eq!(unread[0].sender.username, "carol");
}

#[tokio::test]
async fn fetching_does_not_mark_anything_read() {
    let fx = fixture().await;
    send(&fx.service, fx.alice, fx.bob, "hello", None).await;

    for _ in 0..3 {
        assert_eq!(fx.service.unread_inbox(fx.bob).await.expect("unread").len(), 1);
    }
    assert_eq!(fx.service.unread_count(fx.bob).await.expect("count"), 1);
}

#[tokio::test]
async fn marking_read_removes_message_from_unread() {
    let fx = fixture().await;
    let keep = send(&fx.service, fx.alice, fx.bob, "keep", None).await;
    let done = send(&fx.service, fx.alice, fx.bob, "done", None).await;

    assert!(fx.service.mark_read(fx.bob, done.id).await.expect("mark"));
    assert!(!fx.service.mark_read(fx.bob, done.id).await.expect("mark twice"));

    let unread = fx.service.unread_inbox(fx.bob).await.expect("unread");
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, keep.id);
    assert_eq!(fx.service.unread_count(fx.bob).await.expect("count"), 1);
}

#[tokio::test]
async fn only_the_receiver_marks_read() {
    let fx = fixture().await;
    let message = send(&fx.service, fx.alice, fx.bob, "for bob", None).await;

    let err = fx
        .service
        .mark_read(fx.alice, message.id)
        .await
        .expect_err("sender cannot mark read");
    assert_eq!(err.code(), ErrorCode::Forbidden);

    let err = fx
        .service
        .mark_read(fx.bob, 8_888)
        .await
        .expect_err("unknown message");
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(fx.service.unread_count(fx.bob).await.expect("count"), 1);
}

#[tokio::test]
async fn inbox_lists_roots_with_first_level_replies() {
    let fx = fixture().await;
    let older = send(&fx.service, fx.alice, fx.bob, "older root", None).await;
    let newer = send(&fx.service, fx.carol, fx.bob, "newer root", None).await;
    let r1 = send(&fx.service, fx.bob, fx.alice, "r1", Some(older.id)).await;
    let r2 = send(&fx.service, fx.alice, fx.bob, "r2", Some(older.id)).await;
    send(&fx.service, fx.bob, fx.alice, "nested", Some(r1.id)).await;
    send(&fx.service, fx.bob, fx.alice, "bob's own root", None).await;

    let inbox = fx.service.inbox(fx.bob).await.expect("inbox");
    let roots: Vec<i64> = inbox.iter().map(|e| e.message.id).collect();
    assert_eq!(roots, vec![newer.id, older.id]);

    assert_eq!(inbox[0].reply_count, 0);
    assert!(inbox[0].replies.is_empty());

    assert_eq!(inbox[1].reply_count, 2);
    let replies: Vec<i64> = inbox[1].replies.iter().map(|m| m.id).collect();
    assert_eq!(replies, vec![r1.id, r2.id]);
}
