// room registry over the shared store

use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::kv::{ContextId, KeyValueStore};

pub const ROOMS_KEY: &str = "meet.active_rooms";
pub const HANDS_KEY_PREFIX: &str = "meet.hands.";
pub const DEFAULT_ADMIN_CAP: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub admins: Vec<String>,
    pub is_private: bool,
}

impl Room {
    pub fn has_admin(&self, name: &str) -> bool {
        self.admins.iter().any(|a| a == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(Room),
    AlreadyMember(Room),
    Full(Room),
    NotFound,
    /// Blank user name; nothing is written.
    Invalid,
}

/// Trim, collapse whitespace runs into `-`, lowercase.
pub fn normalize_room_id(raw: &str) -> String {
    let nfc: String = raw.trim().nfc().collect();
    nfc.split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

pub fn hands_key(room_id: &str) -> String {
    format!("{HANDS_KEY_PREFIX}{room_id}")
}

/// Every mutation reads the full collection, edits it, and writes it back.
/// Two clients doing this at once race; the later write wins.
#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn KeyValueStore>,
    origin: ContextId,
    admin_cap: Option<usize>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, origin: ContextId, admin_cap: Option<usize>) -> Self {
        Self {
            store,
            origin,
            admin_cap,
        }
    }

    pub fn origin(&self) -> ContextId {
        self.origin
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>> {
        Ok(compact(self.load().await?))
    }

    pub async fn find(&self, id: &str) -> Result<Option<Room>> {
        let id = normalize_room_id(id);
        Ok(self.list_rooms().await?.into_iter().find(|r| r.id == id))
    }

    /// `Ok(None)` when the id or creator is blank; nothing is written.
    pub async fn create_room(
        &self,
        id: &str,
        creator: &str,
        is_private: bool,
    ) -> Result<Option<Room>> {
        let id = normalize_room_id(id);
        let creator = creator.trim();
        if id.is_empty() || creator.is_empty() {
            return Ok(None);
        }

        let mut rooms = compact(self.load().await?);
        let room = match rooms.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                if existing.has_admin(creator) || !self.has_room(existing) {
                    return Ok(Some(existing.clone()));
                }
                existing.admins.push(creator.to_string());
                existing.clone()
            }
            None => {
                let room = Room {
                    id: id.clone(),
                    admins: vec![creator.to_string()],
                    is_private,
                };
                rooms.push(room.clone());
                room
            }
        };
        self.save(&rooms).await?;
        info!(room = %room.id, user = %creator, admins = room.admins.len(), "create room");
        Ok(Some(room))
    }

    pub async fn join_room(&self, id: &str, user: &str) -> Result<JoinOutcome> {
        let id = normalize_room_id(id);
        let user = user.trim();
        if user.is_empty() {
            return Ok(JoinOutcome::Invalid);
        }
        let mut rooms = compact(self.load().await?);
        let Some(room) = rooms.iter_mut().find(|r| r.id == id) else {
            return Ok(JoinOutcome::NotFound);
        };
        if room.has_admin(user) {
            return Ok(JoinOutcome::AlreadyMember(room.clone()));
        }
        if !self.has_room(room) {
            return Ok(JoinOutcome::Full(room.clone()));
        }
        room.admins.push(user.to_string());
        let joined = room.clone();
        self.save(&rooms).await?;
        info!(room = %joined.id, user = %user, "joined room");
        Ok(JoinOutcome::Joined(joined))
    }

    pub async fn leave_room(&self, id: &str, user: &str) -> Result<()> {
        let id = normalize_room_id(id);
        let user = user.trim();
        // guests can raise a hand without holding an admin slot
        self.lower_hand(&id, user).await?;
        let mut rooms = compact(self.load().await?);
        let Some(idx) = rooms.iter().position(|r| r.id == id) else {
            return Ok(());
        };
        if !rooms[idx].has_admin(user) {
            return Ok(());
        }
        rooms[idx].admins.retain(|a| a != user);
        let emptied = rooms[idx].admins.is_empty();
        if emptied {
            rooms.remove(idx);
        }
        self.save(&rooms).await?;
        if emptied {
            self.store.remove(&hands_key(&id), self.origin).await?;
            info!(room = %id, user = %user, "last admin left, room removed");
        } else {
            info!(room = %id, user = %user, "left room");
        }
        Ok(())
    }

    pub async fn raised_hands(&self, id: &str) -> Result<Vec<String>> {
        let key = hands_key(&normalize_room_id(id));
        Ok(self.read_json::<Vec<String>>(&key).await?.unwrap_or_default())
    }

    pub async fn raise_hand(&self, id: &str, user: &str) -> Result<()> {
        let key = hands_key(&normalize_room_id(id));
        let mut hands = self.read_json::<Vec<String>>(&key).await?.unwrap_or_default();
        if hands.iter().any(|h| h == user) {
            return Ok(());
        }
        hands.push(user.to_string());
        self.store
            .set(&key, &serde_json::to_string(&hands)?, self.origin)
            .await
    }

    pub async fn lower_hand(&self, id: &str, user: &str) -> Result<()> {
        let key = hands_key(&normalize_room_id(id));
        let Some(mut hands) = self.read_json::<Vec<String>>(&key).await? else {
            return Ok(());
        };
        let before = hands.len();
        hands.retain(|h| h != user);
        if hands.len() == before {
            return Ok(());
        }
        if hands.is_empty() {
            self.store.remove(&key, self.origin).await
        } else {
            self.store
                .set(&key, &serde_json::to_string(&hands)?, self.origin)
                .await
        }
    }

    fn has_room(&self, room: &Room) -> bool {
        self.admin_cap.map_or(true, |cap| room.admins.len() < cap)
    }

    async fn load(&self) -> Result<Vec<Room>> {
        Ok(self.read_json::<Vec<Room>>(ROOMS_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, rooms: &[Room]) -> Result<()> {
        let raw = serde_json::to_string(rooms)?;
        self.store.set(ROOMS_KEY, &raw, self.origin).await
    }

    /// Unparsable values read as absent; the next write replaces them.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(key, error = %e, "discarding corrupt entry");
                Ok(None)
            }
        }
    }
}

// drop admin-less rooms and later duplicates, keeping first-seen order
fn compact(rooms: Vec<Room>) -> Vec<Room> {
    let mut out: Vec<Room> = Vec::with_capacity(rooms.len());
    for mut room in rooms {
        if out.iter().any(|r| r.id == room.id) {
            continue;
        }
        let mut seen: Vec<String> = Vec::with_capacity(room.admins.len());
        room.admins.retain(|a| {
            if seen.contains(a) {
                false
            } else {
                seen.push(a.clone());
                true
            }
        });
        if !room.admins.is_empty() {
            out.push(room);
        }
    }
    out
}
