//! Live transcript updates for dashboard observers connected over WebSocket.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

pub const NEW_MESSAGE_EVENT: &str = "new_message";

/// Per-observer queue depth. Updates past this are dropped for that observer.
pub const DEFAULT_OBSERVER_BUFFER: usize = 256;

pub struct Publisher {
    clients: Mutex<HashMap<usize, mpsc::Sender<String>>>,
    next_client_id: AtomicUsize,
    buffer: usize,
}

impl Default for Publisher {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OBSERVER_BUFFER)
    }
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl Publisher {
    pub fn with_capacity(buffer: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicUsize::new(0),
            buffer: buffer.max(1),
        }
    }

    /// Push `{event, data}` to every connected observer without waiting.
    /// Closed clients are skipped; an observer whose queue is full misses
    /// this update.
    pub async fn publish<T: Serialize>(&self, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };

        let senders = {
            let clients = self.clients.lock().await;
            clients
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect::<Vec<_>>()
        };

        for (client_id, sender) in senders {
            match sender.try_send(payload.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(client_id, event, "observer queue full, update dropped");
                }
            }
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn subscribe(&self) -> (usize, mpsc::Receiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel::<String>(self.buffer);
        self.clients.lock().await.insert(client_id, tx);
        (client_id, rx)
    }

    pub async fn unsubscribe(&self, client_id: usize) {
        self.clients.lock().await.remove(&client_id);
    }

    pub async fn serve_socket(&self, socket: WebSocket) {
        let (client_id, mut rx) = self.subscribe().await;
        tracing::debug!(client_id, "observer connected");

        let (mut ws_sender, mut ws_receiver) = socket.split();

        let send_task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(message)) = ws_receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }

        self.unsubscribe(client_id).await;
        send_task.abort();
        tracing::debug!(client_id, "observer disconnected");
    }
}
