use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{AccountId, ChatId, MessageId},
    error::{ApiError, ApiException},
    protocol::{ChatSummary, ClientFrame, LastMessage, MessagePayload, ServerFrame},
};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

mod outbox;

pub use outbox::{Outbox, PendingEntry, PendingState};

const EVENT_QUEUE: usize = 64;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    account_id: i64,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateChatRequest {
    target_account_id: i64,
}

#[derive(Debug, Serialize)]
struct MarkReadRequest {
    through_seq: i64,
}

/// Events surfaced to the UI layer after reconciliation against the local
/// outbox. A confirmed send carries its provisional entry so the rendering
/// can swap the placeholder for the server record.
#[derive(Debug)]
pub enum ClientEvent {
    MessageReceived {
        message: MessagePayload,
    },
    MessageConfirmed {
        entry: PendingEntry,
        message_id: MessageId,
        seq: i64,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
        last_message: Option<LastMessage>,
    },
    SendFailed {
        entry: PendingEntry,
        error: ApiError,
    },
    ErrorReceived {
        error: ApiError,
    },
}

/// Routes one server frame through the outbox. Pure reconciliation logic,
/// shared by the live read loop and the tests.
pub fn apply_server_frame(outbox: &mut Outbox, frame: ServerFrame) -> Option<ClientEvent> {
    match frame {
        ServerFrame::Ack {
            message_id,
            seq,
            correlation_id,
        } => outbox
            .confirm_ack(correlation_id)
            .map(|entry| ClientEvent::MessageConfirmed {
                entry,
                message_id,
                seq,
            }),
        ServerFrame::Message { message } => match outbox.reconcile_broadcast(&message) {
            Some(entry) => Some(ClientEvent::MessageConfirmed {
                entry,
                message_id: message.message_id,
                seq: message.seq,
            }),
            None => Some(ClientEvent::MessageReceived { message }),
        },
        ServerFrame::MessageDeleted {
            chat_id,
            message_id,
            last_message,
        } => Some(ClientEvent::MessageDeleted {
            chat_id,
            message_id,
            last_message,
        }),
        ServerFrame::Error {
            error,
            correlation_id,
        } => match correlation_id.and_then(|id| outbox.fail(id, error.clone())) {
            Some(entry) => Some(ClientEvent::SendFailed { entry, error }),
            None => Some(ClientEvent::ErrorReceived { error }),
        },
    }
}

pub struct ChatClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    account_id: Option<AccountId>,
}

impl ChatClient {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: Client::new(),
            base_url,
            token: None,
            account_id: None,
        }
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub async fn login(&mut self, username: &str) -> Result<AccountId> {
        let url = self.base_url.join("login")?;
        let response = self
            .http
            .post(url)
            .json(&LoginRequest { username })
            .send()
            .await
            .context("login request failed")?;
        let login: LoginResponse = expect_json(response).await?;

        let account_id = AccountId(login.account_id);
        self.token = Some(login.token);
        self.account_id = Some(account_id);
        Ok(account_id)
    }

    pub async fn resolve_chat(&self, target: AccountId) -> Result<ChatSummary> {
        let url = self.base_url.join("chats")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(&CreateChatRequest {
                target_account_id: target.0,
            })
            .send()
            .await
            .context("resolve chat request failed")?;
        expect_json(response).await
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatSummary>> {
        let url = self.base_url.join("chats")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .context("list chats request failed")?;
        expect_json(response).await
    }

    pub async fn list_messages(
        &self,
        chat_id: ChatId,
        after_seq: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<MessagePayload>> {
        let mut url = self.base_url.join(&format!("chats/{}/messages", chat_id.0))?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(after) = after_seq {
                pairs.append_pair("after", &after.to_string());
            }
            if let Some(limit) = limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .context("list messages request failed")?;
        expect_json(response).await
    }

    pub async fn mark_read(&self, chat_id: ChatId, through_seq: i64) -> Result<()> {
        let url = self.base_url.join(&format!("chats/{}/read", chat_id.0))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.token()?)
            .json(&MarkReadRequest { through_seq })
            .send()
            .await
            .context("mark read request failed")?;
        expect_ok(response).await
    }

    pub async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<()> {
        let url = self
            .base_url
            .join(&format!("chats/{}/messages/{}", chat_id.0, message_id.0))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .context("delete message request failed")?;
        expect_ok(response).await
    }

    pub async fn delete_chat(&self, chat_id: ChatId) -> Result<()> {
        let url = self.base_url.join(&format!("chats/{}", chat_id.0))?;
        let response = self
            .http
            .delete(url)
            .bearer_auth(self.token()?)
            .send()
            .await
            .context("delete chat request failed")?;
        expect_ok(response).await
    }

    /// Opens the live connection. The returned handle owns the outbox; every
    /// incoming frame is reconciled against it before reaching the caller.
    pub async fn connect(&self) -> Result<ChatConnection> {
        let account_id = self
            .account_id
            .ok_or_else(|| anyhow!("login before connecting"))?;
        let token = self.token()?.to_string();

        let mut ws_url = self.base_url.join("ws")?;
        let scheme = match ws_url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        ws_url
            .set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.base_url))?;
        ws_url.query_pairs_mut().append_pair("token", &token);

        let (socket, _) = connect_async(ws_url.as_str())
            .await
            .context("websocket handshake failed")?;
        let (mut sink, mut stream) = socket.split();

        let outbox = Arc::new(Mutex::new(Outbox::new(account_id)));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (frames_tx, mut frames_rx) = mpsc::channel::<ClientFrame>(EVENT_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_outbox = outbox.clone();
        let reader = tokio::spawn(async move {
            while let Some(incoming) = stream.next().await {
                let text = match incoming {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let frame = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%err, "dropping unparseable server frame");
                        continue;
                    }
                };
                let event = {
                    let mut outbox = reader_outbox.lock().await;
                    apply_server_frame(&mut outbox, frame)
                };
                if let Some(event) = event {
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            debug!("server connection closed");
        });

        Ok(ChatConnection {
            outbox,
            events: events_rx,
            frames: frames_tx,
            writer,
            reader,
        })
    }

    fn token(&self) -> Result<&str> {
        self.token.as_deref().ok_or_else(|| anyhow!("not logged in"))
    }
}

pub struct ChatConnection {
    outbox: Arc<Mutex<Outbox>>,
    events: mpsc::Receiver<ClientEvent>,
    frames: mpsc::Sender<ClientFrame>,
    writer: tokio::task::JoinHandle<()>,
    reader: tokio::task::JoinHandle<()>,
}

impl ChatConnection {
    /// Optimistic send: the provisional entry is visible immediately via
    /// `pending_for_chat`; confirmation or failure arrives as a ClientEvent.
    pub async fn send(&self, chat_id: ChatId, text: &str) -> Result<PendingEntry> {
        let entry = self.outbox.lock().await.enqueue(chat_id, text);
        self.frames
            .send(ClientFrame::Send {
                chat_id,
                text: text.to_string(),
                correlation_id: entry.correlation_id,
            })
            .await
            .map_err(|_| anyhow!("connection closed"))?;
        Ok(entry)
    }

    pub async fn subscribe(&self, chat_id: ChatId) -> Result<()> {
        self.frames
            .send(ClientFrame::Subscribe { chat_id })
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    pub async fn unsubscribe(&self, chat_id: ChatId) -> Result<()> {
        self.frames
            .send(ClientFrame::Unsubscribe { chat_id })
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub async fn pending_for_chat(&self, chat_id: ChatId) -> Vec<PendingEntry> {
        self.outbox
            .lock()
            .await
            .pending_for_chat(chat_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn discard_failed(&self, correlation_id: Uuid) -> Option<PendingEntry> {
        self.outbox.lock().await.discard(correlation_id)
    }
}

impl Drop for ChatConnection {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn expect_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.context("malformed response body");
    }
    Err(into_api_exception(response).await)
}

async fn expect_ok(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(into_api_exception(response).await)
}

async fn into_api_exception(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(error) => ApiException::new(error.code, error.message).into(),
        Err(_) => anyhow!("request failed with status {status}"),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
