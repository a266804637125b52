//! Backplane - Cross-Instance Invalidation
//!
//! A publish/subscribe channel that carries eviction signals only, never
//! values. Every instance of a named cache subscribes to the same channel
//! (`{keyPrefix}:backplane:{cacheName}`) and evicts its own L1 on receipt.
//!
//! ```text
//!   instance A ── set("k") ──▶ publish(Evict{k}) ──┐
//!                                                  ├──▶ instance B: L1.remove("k")
//!                                                  └──▶ instance A: ignored (own message)
//! ```
//!
//! Delivery is at-least-once; handlers must be idempotent. A subscriber that
//! falls behind receives a synthetic `Clear` in place of the dropped messages.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{CacheError, Result};

/// Per-channel buffer of the in-memory hub
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Invalidation action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BackplaneAction {
    /// Drop one normalized key from L1
    Evict { key: String },
    /// Drop every L1 entry under a key segment (one tenant)
    EvictPrefix { prefix: String },
    /// Drop every L1 entry of the cache
    Clear,
}

/// Message exchanged between instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackplaneMessage {
    /// Instance that published the message
    pub source_id: String,
    #[serde(flatten)]
    pub action: BackplaneAction,
}

impl BackplaneMessage {
    pub fn evict(source_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            action: BackplaneAction::Evict { key: key.into() },
        }
    }

    pub fn evict_prefix(source_id: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            action: BackplaneAction::EvictPrefix {
                prefix: prefix.into(),
            },
        }
    }

    pub fn clear(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            action: BackplaneAction::Clear,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| CacheError::Serialization {
                type_name: "BackplaneMessage".to_string(),
                source: e.into(),
            })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| CacheError::Deserialization {
            type_name: "BackplaneMessage".to_string(),
            source: e.into(),
        })
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait Backplane: Send + Sync {
    async fn publish(&self, channel: &str, message: &BackplaneMessage) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BackplaneSubscription>>;
}

/// Stream of messages on one channel
#[async_trait]
pub trait BackplaneSubscription: Send {
    /// Next message, or `None` once the channel is closed
    async fn next_message(&mut self) -> Option<BackplaneMessage>;
}

// =============================================================================
// In-memory hub
// =============================================================================

/// Process-wide backplane built on `tokio::sync::broadcast`.
/// Clones share the same channels.
#[derive(Clone)]
pub struct InMemoryBackplane {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
    online: Arc<AtomicBool>,
    published: Arc<AtomicU64>,
}

impl Default for InMemoryBackplane {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            online: Arc::new(AtomicBool::new(true)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate a transport outage
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .value()
            .clone()
    }
}

#[async_trait]
impl Backplane for InMemoryBackplane {
    async fn publish(&self, channel: &str, message: &BackplaneMessage) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(CacheError::upstream_msg("in-memory backplane is offline"));
        }
        let payload = message.to_bytes()?;
        // No subscribers is not a failure
        let _ = self.sender(channel).send(payload);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn BackplaneSubscription>> {
        Ok(Box::new(InMemorySubscription {
            channel: channel.to_string(),
            receiver: self.sender(channel).subscribe(),
        }))
    }
}

struct InMemorySubscription {
    channel: String,
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl BackplaneSubscription for InMemorySubscription {
    async fn next_message(&mut self) -> Option<BackplaneMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => match BackplaneMessage::from_bytes(&payload) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        warn!(channel = %self.channel, error = %e, "Dropping undecodable backplane message");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Backplane subscriber lagged, clearing L1");
                    return Some(BackplaneMessage::clear(""));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
