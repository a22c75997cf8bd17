use crate::bus::ConversationKey;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    Connected,
    Status,
    Message,
    Error,
}

/// One event pushed to a connected client: `{"type","message","timestamp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyEvent {
    #[serde(rename = "type")]
    pub kind: NotifyKind,
    pub message: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl NotifyEvent {
    pub fn new(kind: NotifyKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: crate::utils::now_ms(),
        }
    }
}

/// Best-effort real-time status channel back to the originating client.
///
/// Returns whether the event reached a live connection. A missing client is
/// not an error.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, key: &ConversationKey, text: &str, kind: NotifyKind) -> bool;
}

/// Notifier that drops everything. Used when `notifier.enabled` is false.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _key: &ConversationKey, _text: &str, _kind: NotifyKind) -> bool {
        false
    }
}

struct Connection {
    id: Uuid,
    tx: mpsc::Sender<NotifyEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SseStats {
    pub active_connections: usize,
    pub connections: Vec<String>,
}

/// Registry of server-sent-event connections, one per conversation.
///
/// Registering again for the same conversation replaces (and thereby closes)
/// the previous connection.
pub struct SseHub {
    connections: Mutex<HashMap<ConversationKey, Connection>>,
    buffer_size: usize,
}

/// Receiving half of a registered connection. Unregisters itself on drop.
pub struct SseSubscription {
    pub id: Uuid,
    pub key: ConversationKey,
    rx: mpsc::Receiver<NotifyEvent>,
    hub: Arc<SseHub>,
}

impl SseSubscription {
    pub async fn recv(&mut self) -> Option<NotifyEvent> {
        self.rx.recv().await
    }
}

impl Drop for SseSubscription {
    fn drop(&mut self) {
        self.hub.unregister(&self.key, self.id);
    }
}

impl SseHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConversationKey, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(self: &Arc<Self>, key: ConversationKey) -> SseSubscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let id = Uuid::new_v4();
        if self
            .lock()
            .insert(key.clone(), Connection { id, tx })
            .is_some()
        {
            debug!("replaced existing SSE connection for {}", key);
        }
        info!("SSE connection registered for {} ({})", key, id);
        SseSubscription {
            id,
            key,
            rx,
            hub: self.clone(),
        }
    }

    /// Remove the connection for `key` if it is still the one identified by `id`.
    pub fn unregister(&self, key: &ConversationKey, id: Uuid) {
        let mut connections = self.lock();
        if connections.get(key).is_some_and(|c| c.id == id) {
            connections.remove(key);
            info!("SSE connection closed for {}", key);
        }
    }

    pub fn has_active_connection(&self, key: &ConversationKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn active_connections(&self) -> usize {
        self.lock().len()
    }

    pub fn stats(&self) -> SseStats {
        let connections = self.lock();
        let mut keys: Vec<String> = connections.keys().map(ToString::to_string).collect();
        keys.sort();
        SseStats {
            active_connections: keys.len(),
            connections: keys,
        }
    }

    fn send(&self, key: &ConversationKey, event: NotifyEvent) -> bool {
        let mut connections = self.lock();
        let Some(connection) = connections.get(key) else {
            debug!("no active SSE connection for {}", key);
            return false;
        };
        match connection.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("SSE buffer full for {}, dropping event", key);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                connections.remove(key);
                debug!("pruned closed SSE connection for {}", key);
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for SseHub {
    async fn notify(&self, key: &ConversationKey, text: &str, kind: NotifyKind) -> bool {
        self.send(key, NotifyEvent::new(kind, text))
    }
}
