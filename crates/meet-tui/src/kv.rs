// shared key-value medium + change feed

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Identifies one running client. Every write is tagged with the writer's id
/// so listeners can tell their own mutations apart from everyone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl ContextId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub origin: ContextId,
}

pub const EVENT_BUFFER: usize = 256;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, origin: ContextId) -> Result<()>;

    async fn remove(&self, key: &str, origin: ContextId) -> Result<()>;

    /// Every mutation from every context is delivered, including the
    /// subscriber's own; filtering by origin is the subscriber's job.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// In-process store. All contexts holding the same `Arc<MemoryStore>` see
/// one another's writes; nothing survives the process.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn publish(&self, key: &str, origin: ContextId) {
        // no receivers is fine
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            origin,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.entries.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, origin: ContextId) -> Result<()> {
        {
            let mut map = self
                .entries
                .write()
                .map_err(|_| anyhow!("store lock poisoned"))?;
            map.insert(key.to_string(), value.to_string());
        }
        self.publish(key, origin);
        Ok(())
    }

    async fn remove(&self, key: &str, origin: ContextId) -> Result<()> {
        let existed = {
            let mut map = self
                .entries
                .write()
                .map_err(|_| anyhow!("store lock poisoned"))?;
            map.remove(key).is_some()
        };
        if existed {
            self.publish(key, origin);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
