use super::*;

async fn test_ctx() -> (ApiContext, AccountId, AccountId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_account("alice").await.expect("alice");
    let bob = storage.create_account("bob").await.expect("bob");
    (ApiContext { storage }, alice, bob)
}

#[tokio::test]
async fn self_chat_is_rejected() {
    let (ctx, alice, _) = test_ctx().await;
    let err = resolve_or_create_chat(&ctx, alice, alice)
        .await
        .expect_err("self chat");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn unknown_target_is_rejected() {
    let (ctx, alice, _) = test_ctx().await;
    let err = resolve_or_create_chat(&ctx, alice, AccountId(9999))
        .await
        .expect_err("ghost target");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn resolve_is_idempotent_across_callers() {
    let (ctx, alice, bob) = test_ctx().await;
    let first = resolve_or_create_chat(&ctx, alice, bob).await.expect("first");
    let second = resolve_or_create_chat(&ctx, bob, alice).await.expect("second");
    assert_eq!(first.chat_id, second.chat_id);
}

#[tokio::test]
async fn non_participant_cannot_send_or_list() {
    let (ctx, alice, bob) = test_ctx().await;
    let mallory = ctx.storage.create_account("mallory").await.expect("mallory");
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");

    let err = send_message(&ctx, mallory, chat.chat_id, "hi")
        .await
        .expect_err("send");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = list_messages(&ctx, mallory, chat.chat_id, None, None)
        .await
        .expect_err("list");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn empty_after_normalization_is_rejected() {
    let (ctx, alice, bob) = test_ctx().await;
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");

    for raw in ["", "   ", "\u{202E}\u{202D}", "\u{0000}\u{0007}"] {
        let err = send_message(&ctx, alice, chat.chat_id, raw)
            .await
            .expect_err("empty text");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}

#[tokio::test]
async fn send_returns_payload_and_updates_projection() {
    let (ctx, alice, bob) = test_ctx().await;
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");

    let sent = send_message(&ctx, alice, chat.chat_id, "Hello").await.expect("send");
    assert_eq!(sent.seq, 1);
    assert_eq!(sent.body, "Hello");

    let chats = list_chats(&ctx, bob).await.expect("chats");
    let head = chats[0].last_message.as_ref().expect("projection");
    assert_eq!(head.body, "Hello");
    assert_eq!(head.seq, 1);
    assert_eq!(chats[0].unread, 1);
}

#[tokio::test]
async fn only_sender_may_delete() {
    let (ctx, alice, bob) = test_ctx().await;
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");
    let sent = send_message(&ctx, alice, chat.chat_id, "mine").await.expect("send");

    let err = delete_message(&ctx, bob, chat.chat_id, sent.message_id)
        .await
        .expect_err("delete by non-sender");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let head = delete_message(&ctx, alice, chat.chat_id, sent.message_id)
        .await
        .expect("delete by sender");
    assert!(head.is_none(), "no survivor remains");
}

#[tokio::test]
async fn delete_reports_recomputed_projection() {
    let (ctx, alice, bob) = test_ctx().await;
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");

    send_message(&ctx, alice, chat.chat_id, "Hello").await.expect("first");
    let second = send_message(&ctx, bob, chat.chat_id, "Hi").await.expect("second");

    let head = delete_message(&ctx, bob, chat.chat_id, second.message_id)
        .await
        .expect("delete")
        .expect("survivor");
    assert_eq!(head.body, "Hello");
    assert_eq!(head.seq, 1);
}

#[tokio::test]
async fn mark_read_then_unread_count_is_accurate() {
    let (ctx, alice, bob) = test_ctx().await;
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");

    send_message(&ctx, alice, chat.chat_id, "one").await.expect("m1");
    send_message(&ctx, bob, chat.chat_id, "two").await.expect("m2");

    mark_read(&ctx, alice, chat.chat_id, 2).await.expect("mark");
    assert_eq!(unread_count(&ctx, alice, chat.chat_id).await.expect("count"), 0);

    let err = mark_read(&ctx, alice, chat.chat_id, -1)
        .await
        .expect_err("negative cursor");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn delete_chat_requires_participant() {
    let (ctx, alice, bob) = test_ctx().await;
    let mallory = ctx.storage.create_account("mallory").await.expect("mallory");
    let chat = resolve_or_create_chat(&ctx, alice, bob).await.expect("chat");

    let err = delete_chat(&ctx, mallory, chat.chat_id)
        .await
        .expect_err("delete by outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    delete_chat(&ctx, alice, chat.chat_id).await.expect("delete");
    let err = list_messages(&ctx, alice, chat.chat_id, None, None)
        .await
        .expect_err("chat gone");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[test]
fn normalize_strips_control_and_bidi_characters() {
    assert_eq!(normalize_text("he\u{202E}llo\u{0007}"), Some("hello".to_string()));
    assert_eq!(normalize_text("  padded  "), Some("padded".to_string()));
    assert_eq!(
        normalize_text("line\nbreak\tkept"),
        Some("line\nbreak\tkept".to_string())
    );
    assert_eq!(normalize_text("\u{2066}\u{2069}"), None);
}

#[test]
fn normalize_truncates_to_bounded_length() {
    let long = "x".repeat(MAX_MESSAGE_CHARS + 100);
    let normalized = normalize_text(&long).expect("non-empty");
    assert_eq!(normalized.chars().count(), MAX_MESSAGE_CHARS);
}
