use crate::api::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const CLIENT_QUEUE: usize = 256;

/// Fan-out registry for board subscribers. Every connected socket gets every
/// broadcast frame; a failed send drops that client.
#[derive(Default)]
pub struct Broadcaster {
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, mpsc::Sender<Message>>>,
}

impl Broadcaster {
    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn register(&self, conn_id: String, sender: mpsc::Sender<Message>) {
        self.clients.write().await.insert(conn_id.clone(), sender);
        info!(event = "client_connected", conn_id = %conn_id);
    }

    async fn remove(&self, conn_id: &str, reason: &str) {
        if self.clients.write().await.remove(conn_id).is_some() {
            info!(event = "client_disconnected", conn_id = %conn_id, reason = reason);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn broadcast(&self, kind: &str, data: Value) {
        let frame = broadcast_frame(kind, data);
        let clients: Vec<(String, mpsc::Sender<Message>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect();

        for (conn_id, sender) in clients {
            if sender.send(Message::Text(frame.clone())).await.is_err() {
                warn!(event = "send_error", conn_id = %conn_id, kind = kind);
                self.remove(&conn_id, "send_error").await;
            }
        }
    }
}

pub fn broadcast_frame(kind: &str, data: Value) -> String {
    serde_json::json!({ "type": kind, "data": data }).to_string()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = state.broadcaster.next_conn_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE);

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(WRITE_TIMEOUT, send).await.is_err() {
                return;
            }
        }
    });

    state.broadcaster.register(conn_id.clone(), tx.clone()).await;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data)).await;
            }
            // Subscribers are read-only; inbound text is ignored.
            Ok(Message::Text(text)) => {
                debug!(event = "client_message_ignored", conn_id = %conn_id, size = text.len());
            }
            Ok(_) => {}
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        }
    }

    state.broadcaster.remove(&conn_id, "disconnect").await;
    drop(tx);
    let _ = write_task.await;
}
