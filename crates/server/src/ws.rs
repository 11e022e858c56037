use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{AccountId, ChatId},
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::AppState;

const OUTBOUND_QUEUE: usize = 64;

/// One authenticated live connection. The bound account is fixed at
/// handshake time; subscriptions are forwarder tasks copying frames from
/// the per-chat broadcast into this connection's outbound queue.
pub(crate) struct Session {
    pub(crate) connection_id: Uuid,
    pub(crate) account_id: AccountId,
    subscriptions: HashMap<ChatId, JoinHandle<()>>,
}

impl Session {
    pub(crate) fn new(account_id: AccountId) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            account_id,
            subscriptions: HashMap::new(),
        }
    }

    fn teardown(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}

pub(crate) async fn run_session(state: Arc<AppState>, socket: WebSocket, account_id: AccountId) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(account_id);
    debug!(
        connection_id = %session.connection_id,
        account_id = account_id.0,
        "session started"
    );

    while let Some(Ok(incoming)) = stream.next().await {
        let text = match incoming {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let rejected = ServerFrame::Error {
                    error: ApiError::new(ErrorCode::Validation, "malformed frame"),
                    correlation_id: None,
                };
                if out_tx.send(rejected).await.is_err() {
                    break;
                }
                continue;
            }
        };

        handle_client_frame(&state, &mut session, frame, &out_tx).await;
    }

    session.teardown();
    drop(out_tx);
    let _ = writer.await;
    debug!(connection_id = %session.connection_id, "session closed");
}

pub(crate) async fn handle_client_frame(
    state: &AppState,
    session: &mut Session,
    frame: ClientFrame,
    out_tx: &mpsc::Sender<ServerFrame>,
) {
    match frame {
        ClientFrame::Send {
            chat_id,
            text,
            correlation_id,
        } => match server_api::send_message(&state.api, session.account_id, chat_id, &text).await {
            Ok(message) => {
                // Publish strictly after the append (and its projection
                // update) committed; the broadcast never races the store.
                state
                    .hub
                    .publish(
                        chat_id,
                        ServerFrame::Message {
                            message: message.clone(),
                        },
                    )
                    .await;
                let ack = ServerFrame::Ack {
                    message_id: message.message_id,
                    seq: message.seq,
                    correlation_id,
                };
                let _ = out_tx.send(ack).await;
            }
            Err(error) => {
                let _ = out_tx
                    .send(ServerFrame::Error {
                        error,
                        correlation_id: Some(correlation_id),
                    })
                    .await;
            }
        },
        ClientFrame::Subscribe { chat_id } => {
            if let Err(error) =
                server_api::ensure_participant(&state.api, chat_id, session.account_id).await
            {
                let _ = out_tx
                    .send(ServerFrame::Error {
                        error,
                        correlation_id: None,
                    })
                    .await;
                return;
            }

            let mut rx = state.hub.subscribe(chat_id).await;
            let forward_tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) => {
                            if forward_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, chat_id = chat_id.0, "subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            if let Some(previous) = session.subscriptions.insert(chat_id, handle) {
                previous.abort();
            }
        }
        ClientFrame::Unsubscribe { chat_id } => {
            if let Some(handle) = session.subscriptions.remove(&chat_id) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
