use shared::{
    domain::{AccountId, ChatId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ChatSummary, LastMessage, MessagePayload},
};
use storage::{Storage, StoredChat, StoredLastMessage, StoredMessage};
use tracing::debug;

pub const MAX_MESSAGE_CHARS: usize = 4096;
const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Finds or creates the unique chat between two accounts. Idempotent for any
/// argument order; the concurrent-create race collapses at the storage layer,
/// so callers always get a valid chat id back.
pub async fn resolve_or_create_chat(
    ctx: &ApiContext,
    requester: AccountId,
    target: AccountId,
) -> Result<ChatSummary, ApiError> {
    if requester == target {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot open a chat with yourself",
        ));
    }
    let target_known = ctx
        .storage
        .account_exists(target)
        .await
        .map_err(internal)?;
    if !target_known {
        return Err(ApiError::new(ErrorCode::NotFound, "target account not found"));
    }

    let chat_id = ctx
        .storage
        .resolve_or_create_chat(requester, target)
        .await
        .map_err(internal)?;
    debug!(chat_id = chat_id.0, "chat resolved");

    let chat = ctx
        .storage
        .load_chat(chat_id, requester)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "resolved chat vanished"))?;
    Ok(chat_summary(chat))
}

pub async fn list_chats(ctx: &ApiContext, account: AccountId) -> Result<Vec<ChatSummary>, ApiError> {
    let chats = ctx
        .storage
        .list_chats_for_account(account)
        .await
        .map_err(internal)?;
    Ok(chats.into_iter().map(chat_summary).collect())
}

pub async fn send_message(
    ctx: &ApiContext,
    sender: AccountId,
    chat_id: ChatId,
    text: &str,
) -> Result<MessagePayload, ApiError> {
    ensure_participant(ctx, chat_id, sender).await?;

    let Some(body) = normalize_text(text) else {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message text is empty after normalization",
        ));
    };

    let message = ctx
        .storage
        .append_message(chat_id, sender, &body)
        .await
        .map_err(internal)?;
    Ok(message_payload(message))
}

/// Only the original sender may delete. Returns the chat's last-message
/// projection as recomputed inside the deletion transaction, so the caller
/// can fan the repair out to live sessions.
pub async fn delete_message(
    ctx: &ApiContext,
    requester: AccountId,
    chat_id: ChatId,
    message_id: MessageId,
) -> Result<Option<LastMessage>, ApiError> {
    ensure_participant(ctx, chat_id, requester).await?;

    let sender = ctx
        .storage
        .message_sender(chat_id, message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if sender != requester {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender may delete a message",
        ));
    }

    let head = ctx
        .storage
        .mark_message_deleted(chat_id, message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    Ok(head.map(last_message))
}

pub async fn list_messages(
    ctx: &ApiContext,
    account: AccountId,
    chat_id: ChatId,
    after_seq: Option<i64>,
    limit: Option<u32>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_participant(ctx, chat_id, account).await?;

    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, DEFAULT_PAGE_SIZE);
    let messages = ctx
        .storage
        .list_messages(chat_id, after_seq.unwrap_or(0), limit)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn mark_read(
    ctx: &ApiContext,
    account: AccountId,
    chat_id: ChatId,
    through_seq: i64,
) -> Result<(), ApiError> {
    ensure_participant(ctx, chat_id, account).await?;
    if through_seq < 0 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "read cursor cannot be negative",
        ));
    }
    ctx.storage
        .mark_read(chat_id, account, through_seq)
        .await
        .map_err(internal)
}

pub async fn unread_count(
    ctx: &ApiContext,
    account: AccountId,
    chat_id: ChatId,
) -> Result<i64, ApiError> {
    ensure_participant(ctx, chat_id, account).await?;
    ctx.storage
        .unread_count(chat_id, account)
        .await
        .map_err(internal)
}

pub async fn delete_chat(
    ctx: &ApiContext,
    requester: AccountId,
    chat_id: ChatId,
) -> Result<(), ApiError> {
    ensure_participant(ctx, chat_id, requester).await?;
    ctx.storage.delete_chat(chat_id).await.map_err(internal)
}

/// Shared access guard: NotFound for unknown chats, Forbidden when the
/// account is not one of the two participants.
pub async fn ensure_participant(
    ctx: &ApiContext,
    chat_id: ChatId,
    account: AccountId,
) -> Result<(AccountId, AccountId), ApiError> {
    let participants = ctx
        .storage
        .chat_participants(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "chat not found"))?;
    if participants.0 != account && participants.1 != account {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "account is not a participant of this chat",
        ));
    }
    Ok(participants)
}

/// Strips control characters (keeping newline and tab) and Unicode
/// bidirectional-override characters, trims surrounding whitespace, and
/// truncates to the bounded message length. None when nothing remains.
pub fn normalize_text(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !is_stripped(*c)).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_MESSAGE_CHARS).collect())
}

fn is_stripped(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return false;
    }
    if c.is_control() {
        return true;
    }
    matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

fn chat_summary(chat: StoredChat) -> ChatSummary {
    ChatSummary {
        chat_id: chat.chat_id,
        participants: (chat.participant_lo, chat.participant_hi),
        last_message: chat.last_message.map(last_message),
        unread: chat.unread,
    }
}

fn last_message(stored: StoredLastMessage) -> LastMessage {
    LastMessage {
        body: stored.body,
        sender_id: stored.sender_id,
        seq: stored.seq,
        sent_at: stored.sent_at,
    }
}

fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        chat_id: message.chat_id,
        sender_id: message.sender_id,
        body: message.body,
        seq: message.seq,
        sent_at: message.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
