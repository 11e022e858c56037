use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{AccountId, ChatId, MessageId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: AccountId,
    pub body: String,
    pub seq: i64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastMessage {
    pub body: String,
    pub sender_id: AccountId,
    pub seq: i64,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub participants: (AccountId, AccountId),
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub unread: i64,
}

/// Frames sent by a live client over the real-time connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Send {
        chat_id: ChatId,
        text: String,
        correlation_id: Uuid,
    },
    Subscribe {
        chat_id: ChatId,
    },
    Unsubscribe {
        chat_id: ChatId,
    },
}

/// Frames pushed to a live client. `Message` and `MessageDeleted` arrive via
/// the per-chat broadcast; `Ack` and `Error` are direct responses to the
/// session that issued the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        message: MessagePayload,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message: Option<LastMessage>,
    },
    Ack {
        message_id: MessageId,
        seq: i64,
        correlation_id: Uuid,
    },
    Error {
        error: ApiError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<Uuid>,
    },
}
