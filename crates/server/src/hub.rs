use std::collections::HashMap;

use shared::{domain::ChatId, protocol::ServerFrame};
use tokio::sync::{broadcast, RwLock};

const BROADCAST_CAPACITY: usize = 256;

/// Per-chat fan-out. Each chat gets its own broadcast channel, created on
/// first subscribe and pruned once the last receiver is gone. The channel
/// carries no history: a session that subscribes after a publish never sees
/// that frame — catch-up goes through the message listing instead.
#[derive(Default)]
pub struct ChatHub {
    channels: RwLock<HashMap<ChatId, broadcast::Sender<ServerFrame>>>,
}

impl ChatHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, chat_id: ChatId) -> broadcast::Receiver<ServerFrame> {
        let mut channels = self.channels.write().await;
        channels
            .entry(chat_id)
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .subscribe()
    }

    pub async fn publish(&self, chat_id: ChatId, frame: ServerFrame) {
        let delivered = {
            let channels = self.channels.read().await;
            match channels.get(&chat_id) {
                Some(sender) => sender.send(frame).is_ok(),
                None => return,
            }
        };

        if !delivered {
            let mut channels = self.channels.write().await;
            if let Some(sender) = channels.get(&chat_id) {
                if sender.receiver_count() == 0 {
                    channels.remove(&chat_id);
                }
            }
        }
    }

    /// Drops the chat's channel entirely; outstanding receivers observe
    /// `Closed` and their forwarders terminate. Used when a chat is deleted.
    pub async fn retire(&self, chat_id: ChatId) {
        self.channels.write().await.remove(&chat_id);
    }

    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
