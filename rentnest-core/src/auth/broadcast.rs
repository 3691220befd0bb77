//! Cross-context session events
//!
//! Several execution contexts (windows, tabs, processes sharing one storage
//! origin) keep their login state in step by exchanging LOGIN/LOGOUT
//! messages over a [`SessionBus`]. Two backends exist: [`ChannelBus`], a
//! direct publish/subscribe channel, and [`StorageBus`], which writes each
//! message into shared storage and lets other contexts notice the change by
//! polling.

use super::storage::{KeyValueStore, SESSION_EVENT_KEY};
use super::types::AuthError;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEventKind {
    Login,
    Logout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub kind: SessionEventKind,
    pub timestamp: DateTime<Utc>,
    /// Context that sent the message
    pub origin: String,
}

/// Topic-based publish/subscribe transport
pub trait SessionBus: Send + Sync {
    fn publish(&self, topic: &str, message: &SessionMessage) -> Result<(), AuthError>;
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<SessionMessage>;
}

/// In-process broadcast channels, one per topic
#[derive(Default)]
pub struct ChannelBus {
    topics: Mutex<HashMap<String, broadcast::Sender<SessionMessage>>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<SessionMessage> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl SessionBus for ChannelBus {
    fn publish(&self, topic: &str, message: &SessionMessage) -> Result<(), AuthError> {
        // No subscribers is not an error: nobody else is open
        let delivered = self.sender(topic).send(message.clone()).unwrap_or(0);
        debug!("{:?} published on {} to {} receivers", message.kind, topic, delivered);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<SessionMessage> {
        self.sender(topic).subscribe()
    }
}

struct TopicPoller {
    tx: broadcast::Sender<SessionMessage>,
    running: bool,
}

/// Fallback bus over shared storage.
///
/// `publish` overwrites a per-topic key; each subscribed topic has a polling
/// task that forwards the value whenever it changes. The poller stops once
/// the last receiver is dropped and restarts on the next `subscribe`.
pub struct StorageBus {
    store: Arc<dyn KeyValueStore>,
    poll_interval: Duration,
    topics: Arc<Mutex<HashMap<String, TopicPoller>>>,
}

impl StorageBus {
    pub fn new(store: Arc<dyn KeyValueStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key(topic: &str) -> String {
        format!("{}:{}", SESSION_EVENT_KEY, topic)
    }

    fn spawn_poller(&self, topic: String, tx: broadcast::Sender<SessionMessage>) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!("StorageBus subscribe outside a Tokio runtime; no events will arrive");
                return false;
            }
        };

        let store = self.store.clone();
        let topics = self.topics.clone();
        let interval = self.poll_interval;
        let key = Self::key(&topic);
        let mut last = store.get(&key);

        handle.spawn(async move {
            debug!("Storage poller started for {}", topic);
            loop {
                tokio::time::sleep(interval).await;

                {
                    let mut topics = topics.lock();
                    if tx.receiver_count() == 0 {
                        if let Some(poller) = topics.get_mut(&topic) {
                            poller.running = false;
                        }
                        debug!("Storage poller for {} stopped (no receivers)", topic);
                        return;
                    }
                }

                let current = store.get(&key);
                if current == last {
                    continue;
                }
                last = current.clone();

                let Some(raw) = current else { continue };
                match serde_json::from_str::<SessionMessage>(&raw) {
                    Ok(message) => {
                        let _ = tx.send(message);
                    }
                    Err(e) => warn!("Ignoring unreadable session event on {}: {}", topic, e),
                }
            }
        });
        true
    }
}

impl SessionBus for StorageBus {
    fn publish(&self, topic: &str, message: &SessionMessage) -> Result<(), AuthError> {
        let json = serde_json::to_string(message)
            .map_err(|e| AuthError::StorageError(format!("Failed to encode event: {}", e)))?;
        self.store.set(&Self::key(topic), &json)
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<SessionMessage> {
        let mut topics = self.topics.lock();
        let poller = topics.entry(topic.to_string()).or_insert_with(|| TopicPoller {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            running: false,
        });
        let rx = poller.tx.subscribe();
        if !poller.running {
            poller.running = self.spawn_poller(topic.to_string(), poller.tx.clone());
        }
        rx
    }
}

/// Publishes this context's LOGIN/LOGOUT events and hands out receivers
/// that never see this context's own messages.
#[derive(Clone)]
pub struct Broadcaster {
    bus: Arc<dyn SessionBus>,
    topic: String,
    origin: String,
}

impl Broadcaster {
    /// Use `primary` when available, `fallback` otherwise
    pub fn new(
        primary: Option<Arc<dyn SessionBus>>,
        fallback: Arc<dyn SessionBus>,
        topic: impl Into<String>,
    ) -> Self {
        let bus = match primary {
            Some(bus) => bus,
            None => {
                info!("Broadcast channel unavailable, using shared-storage events");
                fallback
            }
        };
        Self {
            bus,
            topic: topic.into(),
            origin: Uuid::new_v4().to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn publish(&self, kind: SessionEventKind) -> Result<(), AuthError> {
        let message = SessionMessage {
            kind,
            timestamp: Utc::now(),
            origin: self.origin.clone(),
        };
        self.bus.publish(&self.topic, &message)
    }

    pub fn subscribe(&self) -> SessionEvents {
        SessionEvents {
            rx: self.bus.subscribe(&self.topic),
            origin: self.origin.clone(),
        }
    }
}

/// Messages from other contexts
pub struct SessionEvents {
    rx: broadcast::Receiver<SessionMessage>,
    origin: String,
}

impl SessionEvents {
    /// Next foreign message, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<SessionMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.origin == self.origin => continue,
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Session event receiver lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
