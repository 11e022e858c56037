use super::*;
use chrono::Utc;
use shared::error::ErrorCode;

fn payload(chat_id: ChatId, sender_id: AccountId, body: &str, seq: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(seq),
        chat_id,
        sender_id,
        body: body.to_string(),
        seq,
        sent_at: Utc::now(),
    }
}

#[test]
fn ack_frame_confirms_pending_entry() {
    let mut outbox = Outbox::new(AccountId(1));
    let entry = outbox.enqueue(ChatId(10), "hello");

    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::Ack {
            message_id: MessageId(42),
            seq: 1,
            correlation_id: entry.correlation_id,
        },
    );

    let Some(ClientEvent::MessageConfirmed {
        entry: confirmed,
        message_id,
        seq,
    }) = event
    else {
        panic!("expected confirmation");
    };
    assert_eq!(confirmed.correlation_id, entry.correlation_id);
    assert_eq!(message_id, MessageId(42));
    assert_eq!(seq, 1);
}

#[test]
fn own_broadcast_confirms_when_ack_is_lost() {
    let mut outbox = Outbox::new(AccountId(1));
    let entry = outbox.enqueue(ChatId(10), "hello");

    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::Message {
            message: payload(ChatId(10), AccountId(1), "hello", 1),
        },
    );

    let Some(ClientEvent::MessageConfirmed { entry: confirmed, .. }) = event else {
        panic!("expected confirmation via broadcast");
    };
    assert_eq!(confirmed.correlation_id, entry.correlation_id);

    // The delayed ack for the already-confirmed entry is swallowed.
    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::Ack {
            message_id: MessageId(1),
            seq: 1,
            correlation_id: entry.correlation_id,
        },
    );
    assert!(event.is_none());
}

#[test]
fn foreign_broadcast_surfaces_as_received() {
    let mut outbox = Outbox::new(AccountId(1));

    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::Message {
            message: payload(ChatId(10), AccountId(2), "hi there", 3),
        },
    );

    let Some(ClientEvent::MessageReceived { message }) = event else {
        panic!("expected received event");
    };
    assert_eq!(message.seq, 3);
}

#[test]
fn correlated_error_marks_send_failed() {
    let mut outbox = Outbox::new(AccountId(1));
    let entry = outbox.enqueue(ChatId(10), "hello");

    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::Error {
            error: ApiError::new(ErrorCode::Forbidden, "not a participant"),
            correlation_id: Some(entry.correlation_id),
        },
    );

    let Some(ClientEvent::SendFailed { entry: failed, error }) = event else {
        panic!("expected send failure");
    };
    assert_eq!(failed.correlation_id, entry.correlation_id);
    assert_eq!(error.code, ErrorCode::Forbidden);
    assert_eq!(outbox.pending_for_chat(ChatId(10)).len(), 1);
}

#[test]
fn uncorrelated_error_is_generic() {
    let mut outbox = Outbox::new(AccountId(1));

    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::Error {
            error: ApiError::new(ErrorCode::Validation, "malformed frame"),
            correlation_id: None,
        },
    );

    assert!(matches!(event, Some(ClientEvent::ErrorReceived { .. })));
}

#[test]
fn deletion_frame_passes_through_with_projection() {
    let mut outbox = Outbox::new(AccountId(1));

    let event = apply_server_frame(
        &mut outbox,
        ServerFrame::MessageDeleted {
            chat_id: ChatId(10),
            message_id: MessageId(2),
            last_message: Some(LastMessage {
                body: "Hello".into(),
                sender_id: AccountId(2),
                seq: 1,
                sent_at: Utc::now(),
            }),
        },
    );

    let Some(ClientEvent::MessageDeleted {
        chat_id,
        message_id,
        last_message,
    }) = event
    else {
        panic!("expected deletion event");
    };
    assert_eq!(chat_id, ChatId(10));
    assert_eq!(message_id, MessageId(2));
    assert_eq!(last_message.expect("projection").seq, 1);
}
