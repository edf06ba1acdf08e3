// keeps one client's room list in step with everyone else's writes

use anyhow::{anyhow, Result};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::kv::{ContextId, StorageEvent};
use crate::rooms::{hands_key, normalize_room_id, Room, RoomRegistry, ROOMS_KEY};

pub struct PresenceSync {
    registry: RoomRegistry,
    me: ContextId,
    rx: broadcast::Receiver<StorageEvent>,
    rooms: Vec<Room>,
    watched: Option<String>,
    hands: Vec<String>,
}

impl PresenceSync {
    /// Subscribes before the first read so no write slips between them.
    pub async fn attach(registry: RoomRegistry) -> Result<Self> {
        let rx = registry.store().subscribe();
        let me = registry.origin();
        let mut sync = Self {
            registry,
            me,
            rx,
            rooms: Vec::new(),
            watched: None,
            hands: Vec::new(),
        };
        sync.refresh().await?;
        Ok(sync)
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn hands(&self) -> &[String] {
        &self.hands
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub async fn watch_room(&mut self, room_id: Option<&str>) -> Result<()> {
        self.watched = room_id.map(normalize_room_id);
        self.refresh().await
    }

    /// Wholesale re-read. Call after every local mutation: our own writes
    /// never come back through the feed as relevant.
    pub async fn refresh(&mut self) -> Result<()> {
        self.rooms = self.registry.list_rooms().await?;
        self.hands = match &self.watched {
            Some(id) => self.registry.raised_hands(id).await?,
            None => Vec::new(),
        };
        debug!(rooms = self.rooms.len(), hands = self.hands.len(), "presence refreshed");
        Ok(())
    }

    /// Non-blocking. Drains queued events and refreshes at most once.
    pub async fn poll(&mut self) -> Result<bool> {
        let mut dirty = false;
        loop {
            match self.rx.try_recv() {
                Ok(ev) => dirty |= self.is_relevant(&ev),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(n)) => {
                    warn!(missed = n, "change feed lagged");
                    dirty = true;
                }
                Err(TryRecvError::Closed) => return Err(anyhow!("change feed closed")),
            }
        }
        if dirty {
            self.refresh().await?;
        }
        Ok(dirty)
    }

    /// Waits for the next change made by another client, then refreshes.
    pub async fn changed(&mut self) -> Result<()> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if self.is_relevant(&ev) => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(missed = n, "change feed lagged");
                    break;
                }
                Err(RecvError::Closed) => return Err(anyhow!("change feed closed")),
            }
        }
        self.refresh().await
    }

    fn is_relevant(&self, ev: &StorageEvent) -> bool {
        if ev.origin == self.me {
            return false;
        }
        if ev.key == ROOMS_KEY {
            return true;
        }
        self.watched
            .as_deref()
            .is_some_and(|id| ev.key == hands_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyValueStore, MemoryStore};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn two_contexts() -> (RoomRegistry, RoomRegistry) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        (
            RoomRegistry::new(store.clone(), ContextId(1), Some(3)),
            RoomRegistry::new(store, ContextId(2), Some(3)),
        )
    }

    #[tokio::test]
    async fn other_context_sees_new_room() -> Result<()> {
        let (a, b) = two_contexts();
        let mut sync_b = PresenceSync::attach(b).await?;
        assert!(sync_b.rooms().is_empty());

        a.create_room("Design Review", "Alice", true).await?;
        assert!(sync_b.poll().await?);
        assert_eq!(sync_b.rooms().len(), 1);
        assert_eq!(sync_b.rooms()[0].id, "design-review");
        Ok(())
    }

    #[tokio::test]
    async fn own_writes_do_not_trigger() -> Result<()> {
        let (a, _) = two_contexts();
        let mut sync_a = PresenceSync::attach(a.clone()).await?;
        a.create_room("solo", "Alice", false).await?;
        assert!(!sync_a.poll().await?);
        // stale until refreshed by hand
        assert!(sync_a.rooms().is_empty());
        sync_a.refresh().await?;
        assert_eq!(sync_a.rooms().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn attach_reads_existing_state() -> Result<()> {
        let (a, b) = two_contexts();
        a.create_room("early", "Alice", false).await?;
        let sync_b = PresenceSync::attach(b).await?;
        assert_eq!(sync_b.rooms().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn changed_wakes_on_remote_leave() -> Result<()> {
        let (a, b) = two_contexts();
        a.create_room("r", "Alice", false).await?;
        let mut sync_b = PresenceSync::attach(b).await?;
        assert_eq!(sync_b.rooms().len(), 1);

        a.leave_room("r", "Alice").await?;
        timeout(Duration::from_secs(1), sync_b.changed()).await??;
        assert!(sync_b.rooms().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn watched_room_tracks_hands() -> Result<()> {
        let (a, b) = two_contexts();
        a.create_room("r", "Alice", false).await?;
        a.create_room("other", "Alice", false).await?;
        b.join_room("r", "Bob").await?;
        let mut sync_b = PresenceSync::attach(b).await?;
        sync_b.watch_room(Some("r")).await?;

        a.raise_hand("other", "Alice").await?;
        assert!(!sync_b.poll().await?);

        a.raise_hand("r", "Alice").await?;
        assert!(sync_b.poll().await?);
        assert_eq!(sync_b.hands(), ["Alice".to_string()]);

        sync_b.watch_room(None).await?;
        assert!(sync_b.hands().is_empty());
        Ok(())
    }
}
