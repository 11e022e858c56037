use super::*;
use chrono::Utc;
use shared::{
    domain::{AccountId, MessageId},
    protocol::MessagePayload,
};

fn frame(chat_id: ChatId, seq: i64) -> ServerFrame {
    ServerFrame::Message {
        message: MessagePayload {
            message_id: MessageId(seq),
            chat_id,
            sender_id: AccountId(1),
            body: format!("message {seq}"),
            seq,
            sent_at: Utc::now(),
        },
    }
}

fn seq_of(frame: &ServerFrame) -> i64 {
    match frame {
        ServerFrame::Message { message } => message.seq,
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn delivers_in_publish_order() {
    let hub = ChatHub::new();
    let chat = ChatId(1);
    let mut rx = hub.subscribe(chat).await;

    for seq in 1..=5 {
        hub.publish(chat, frame(chat, seq)).await;
    }

    for expected in 1..=5 {
        let received = rx.recv().await.expect("frame");
        assert_eq!(seq_of(&received), expected);
    }
}

#[tokio::test]
async fn late_subscriber_gets_no_history() {
    let hub = ChatHub::new();
    let chat = ChatId(1);

    let mut early = hub.subscribe(chat).await;
    hub.publish(chat, frame(chat, 1)).await;

    let mut late = hub.subscribe(chat).await;
    hub.publish(chat, frame(chat, 2)).await;

    assert_eq!(seq_of(&early.recv().await.expect("first")), 1);
    assert_eq!(seq_of(&early.recv().await.expect("second")), 2);
    // The late session only observes what was published after it joined.
    assert_eq!(seq_of(&late.recv().await.expect("only")), 2);
    assert!(late.try_recv().is_err());
}

#[tokio::test]
async fn chats_are_isolated_from_each_other() {
    let hub = ChatHub::new();
    let mut rx_one = hub.subscribe(ChatId(1)).await;
    let mut rx_two = hub.subscribe(ChatId(2)).await;

    hub.publish(ChatId(1), frame(ChatId(1), 1)).await;

    assert_eq!(seq_of(&rx_one.recv().await.expect("frame")), 1);
    assert!(rx_two.try_recv().is_err());
}

#[tokio::test]
async fn publish_without_subscribers_prunes_channel() {
    let hub = ChatHub::new();
    let chat = ChatId(1);

    let rx = hub.subscribe(chat).await;
    drop(rx);
    assert_eq!(hub.channel_count().await, 1);

    hub.publish(chat, frame(chat, 1)).await;
    assert_eq!(hub.channel_count().await, 0);
}

#[tokio::test]
async fn retire_closes_outstanding_receivers() {
    let hub = ChatHub::new();
    let chat = ChatId(1);
    let mut rx = hub.subscribe(chat).await;

    hub.retire(chat).await;
    assert!(matches!(
        rx.recv().await,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    ));
}
