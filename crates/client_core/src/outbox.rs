use std::time::{Duration, Instant};

use shared::{
    domain::{AccountId, ChatId},
    error::ApiError,
    protocol::MessagePayload,
};
use uuid::Uuid;

/// How long a broadcast may trail the local send and still be matched to a
/// provisional entry when the ack was lost.
const RECONCILE_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum PendingState {
    Pending,
    Failed(ApiError),
}

/// A provisional, locally-rendered message awaiting server confirmation.
/// The correlation id is client-generated; the server echoes it back in the
/// ack so the entry can be replaced by the confirmed record.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub correlation_id: Uuid,
    pub chat_id: ChatId,
    pub text: String,
    pub state: PendingState,
    pub queued_at: Instant,
}

impl PendingEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self.state, PendingState::Pending)
    }
}

/// Local store of optimistic sends. Entries leave the outbox when confirmed;
/// failures stay visible until explicitly discarded, never silently dropped.
pub struct Outbox {
    sender: AccountId,
    entries: Vec<PendingEntry>,
}

impl Outbox {
    pub fn new(sender: AccountId) -> Self {
        Self {
            sender,
            entries: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, chat_id: ChatId, text: &str) -> PendingEntry {
        let entry = PendingEntry {
            correlation_id: Uuid::new_v4(),
            chat_id,
            text: text.to_string(),
            state: PendingState::Pending,
            queued_at: Instant::now(),
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Direct confirmation: the server acked the correlation id.
    pub fn confirm_ack(&mut self, correlation_id: Uuid) -> Option<PendingEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.correlation_id == correlation_id)?;
        Some(self.entries.remove(index))
    }

    /// Fallback confirmation for the at-least-once path: a broadcast of our
    /// own message arrived without (or before) the ack. Matched by chat,
    /// exact body and temporal proximity, since server and client ids differ.
    pub fn reconcile_broadcast(&mut self, message: &MessagePayload) -> Option<PendingEntry> {
        if message.sender_id != self.sender {
            return None;
        }
        let index = self.entries.iter().position(|e| {
            e.is_pending()
                && e.chat_id == message.chat_id
                && e.text == message.body
                && e.queued_at.elapsed() <= RECONCILE_WINDOW
        })?;
        Some(self.entries.remove(index))
    }

    pub fn fail(&mut self, correlation_id: Uuid, error: ApiError) -> Option<PendingEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.correlation_id == correlation_id)?;
        entry.state = PendingState::Failed(error);
        Some(entry.clone())
    }

    /// User-initiated dismissal of a failed entry.
    pub fn discard(&mut self, correlation_id: Uuid) -> Option<PendingEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.correlation_id == correlation_id)?;
        Some(self.entries.remove(index))
    }

    pub fn pending_for_chat(&self, chat_id: ChatId) -> Vec<&PendingEntry> {
        self.entries
            .iter()
            .filter(|e| e.chat_id == chat_id)
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
