// per-client session: entry/exit lifecycle, local toggles, chat

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use thiserror::Error;
use tracing::{info, warn};

use crate::media::{MediaCapture, MediaError, MediaHandle};
use crate::nick;
use crate::rooms::{normalize_room_id, JoinOutcome, RoomRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Entering,
    Active,
    Exiting,
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("Please enter your name.")]
    MissingName,
    #[error("{0}")]
    InvalidName(&'static str),
    #[error("Please enter a room name.")]
    MissingRoom,
    #[error("Room {0} no longer exists.")]
    RoomNotFound(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryMode {
    Create { is_private: bool },
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    pub sent_at: DateTime<Local>,
}

impl ChatMessage {
    pub fn time_label(&self) -> String {
        self.sent_at.format("%H:%M").to_string()
    }
}

#[derive(Debug)]
pub struct SessionState {
    phase: Phase,
    pub user_name: String,
    pub current_room_id: Option<String>,
    pub is_admin: bool,
    pub is_muted: bool,
    pub is_hand_raised: bool,
    camera: Option<MediaHandle>,
    screen: Option<MediaHandle>,
    transcript: Vec<ChatMessage>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            user_name: String::new(),
            current_room_id: None,
            is_admin: false,
            is_muted: false,
            is_hand_raised: false,
            camera: None,
            screen: None,
            transcript: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Validates the form. On failure the session stays Idle.
    pub fn begin_entry(&mut self, name: &str, room: &str) -> Result<String, EntryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EntryError::MissingName);
        }
        nick::check_user_name(name).map_err(EntryError::InvalidName)?;
        let room_id = normalize_room_id(room);
        if room_id.is_empty() {
            return Err(EntryError::MissingRoom);
        }
        self.reset();
        self.user_name = name.to_string();
        self.phase = Phase::Entering;
        Ok(room_id)
    }

    pub fn activate(&mut self, room_id: &str, is_admin: bool) {
        self.current_room_id = Some(room_id.to_string());
        self.is_admin = is_admin;
        self.phase = Phase::Active;
    }

    pub fn begin_exit(&mut self) -> Option<(String, String)> {
        if self.phase != Phase::Active {
            return None;
        }
        self.phase = Phase::Exiting;
        self.current_room_id
            .clone()
            .map(|id| (id, self.user_name.clone()))
    }

    /// Back to Idle; every field is cleared and held devices are released.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_camera_off(&self) -> bool {
        self.camera.is_none()
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.screen.is_some()
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.is_muted = !self.is_muted;
        self.is_muted
    }

    /// Returns whether the camera is now on. A refused acquisition leaves it off.
    pub fn toggle_camera(&mut self, capture: &dyn MediaCapture) -> Result<bool, MediaError> {
        if self.camera.take().is_some() {
            return Ok(false);
        }
        self.camera = Some(capture.acquire_camera()?);
        Ok(true)
    }

    pub fn toggle_screen_share(&mut self, capture: &dyn MediaCapture) -> Result<bool, MediaError> {
        if self.screen.take().is_some() {
            return Ok(false);
        }
        self.screen = Some(capture.acquire_screen()?);
        Ok(true)
    }

    pub fn toggle_hand(&mut self) -> bool {
        self.is_hand_raised = !self.is_hand_raised;
        self.is_hand_raised
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn add_message(&mut self, sender: &str, text: &str) -> bool {
        self.push_message(sender, text, Local::now())
    }

    fn push_message(&mut self, sender: &str, text: &str, sent_at: DateTime<Local>) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.transcript.push(ChatMessage {
            sender: sender.to_string(),
            text: text.to_string(),
            sent_at,
        });
        true
    }

    pub fn meeting_log(&self, admins: &[String], date: NaiveDate) -> String {
        let room = self.current_room_id.as_deref().unwrap_or("");
        let mut out = format!(
            "=== MEETING LOG ===\nRoom: {}\nDate: {}\nAdmins: {}\n----------------------------\n\n",
            room,
            date.format("%Y-%m-%d"),
            admins.join(", ")
        );
        let body: Vec<String> = self
            .transcript
            .iter()
            .map(|m| format!("[{}] {}: {}", m.time_label(), m.sender, m.text))
            .collect();
        out.push_str(&body.join("\n"));
        out
    }

    pub fn write_meeting_log(&self, dir: &Path, admins: &[String]) -> Result<PathBuf> {
        let room = self.current_room_id.as_deref().unwrap_or("room");
        let path = dir.join(format!("Log_{}.txt", file_safe(room)));
        let text = self.meeting_log(admins, Local::now().date_naive());
        std::fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        info!(room, path = %path.display(), "meeting log written");
        Ok(path)
    }
}

fn file_safe(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// A claim on a room's admin list. Release it explicitly on every exit
/// path; if it is dropped instead, a leave is queued on the running
/// runtime, which may not get to run before the process ends.
pub struct Membership {
    registry: RoomRegistry,
    room_id: String,
    user: String,
    released: bool,
}

impl Membership {
    pub fn new(registry: RoomRegistry, room_id: &str, user: &str) -> Self {
        Self {
            registry,
            room_id: room_id.to_string(),
            user: user.to_string(),
            released: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.registry.leave_room(&self.room_id, &self.user).await
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(room = %self.room_id, user = %self.user, "membership dropped without runtime");
            return;
        };
        let registry = self.registry.clone();
        let room_id = std::mem::take(&mut self.room_id);
        let user = std::mem::take(&mut self.user);
        handle.spawn(async move {
            if let Err(e) = registry.leave_room(&room_id, &user).await {
                warn!(room = %room_id, user = %user, error = %e, "deferred leave failed");
            }
        });
    }
}

/// Idle -> Entering -> Active. The session is left Idle on any error.
pub async fn enter(
    session: &mut SessionState,
    registry: &RoomRegistry,
    name: &str,
    room: &str,
    mode: EntryMode,
) -> Result<Membership, EntryError> {
    let room_id = session.begin_entry(name, room)?;
    let user = session.user_name.clone();
    let admitted = match mode {
        EntryMode::Create { is_private } => {
            match registry.create_room(&room_id, &user, is_private).await {
                Ok(Some(room)) => Ok(room.has_admin(&user)),
                Ok(None) => Err(EntryError::MissingRoom),
                Err(e) => Err(e.into()),
            }
        }
        EntryMode::Join => match registry.join_room(&room_id, &user).await {
            Ok(JoinOutcome::Joined(_)) | Ok(JoinOutcome::AlreadyMember(_)) => Ok(true),
            Ok(JoinOutcome::Full(_)) => Ok(false),
            Ok(JoinOutcome::NotFound) => Err(EntryError::RoomNotFound(room_id.clone())),
            Ok(JoinOutcome::Invalid) => Err(EntryError::MissingName),
            Err(e) => Err(e.into()),
        },
    };
    let is_admin = match admitted {
        Ok(v) => v,
        Err(e) => {
            session.reset();
            return Err(e);
        }
    };
    session.activate(&room_id, is_admin);
    info!(room = %room_id, user = %user, is_admin, "entered room");
    Ok(Membership::new(registry.clone(), &room_id, &user))
}

/// Active -> Exiting -> Idle. The session is cleared even when the
/// registry write fails.
pub async fn exit(session: &mut SessionState, membership: Membership) -> Result<()> {
    if let Some((room, user)) = session.begin_exit() {
        info!(room = %room, user = %user, "leaving room");
    }
    let res = membership.release().await;
    session.reset();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{ContextId, KeyValueStore, MemoryStore};
    use crate::media::DeviceCapture;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn registry() -> RoomRegistry {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        RoomRegistry::new(store, ContextId(1), Some(3))
    }

    fn no_devices() -> DeviceCapture {
        DeviceCapture {
            camera_path: PathBuf::from("/definitely/not/a/camera"),
            allow_screen: false,
        }
    }

    #[test]
    fn empty_name_keeps_idle() {
        let mut s = SessionState::new();
        let err = s.begin_entry("   ", "standup").unwrap_err();
        assert!(matches!(err, EntryError::MissingName));
        assert_eq!(err.to_string(), "Please enter your name.");
        assert_eq!(s.phase(), Phase::Idle);
        assert!(matches!(s.begin_entry("Alice", "  "), Err(EntryError::MissingRoom)));
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn create_then_exit_cleans_registry() -> Result<()> {
        let reg = registry();
        let mut s = SessionState::new();
        let m = enter(&mut s, &reg, "Alice", "Weekly Standup", EntryMode::Create { is_private: false })
            .await?;
        assert_eq!(s.phase(), Phase::Active);
        assert_eq!(s.current_room_id.as_deref(), Some("weekly-standup"));
        assert!(s.is_admin);
        assert_eq!(m.room_id(), "weekly-standup");

        s.add_message("Alice", "hello");
        exit(&mut s, m).await?;
        assert_eq!(s.phase(), Phase::Idle);
        assert!(s.transcript().is_empty());
        assert!(s.user_name.is_empty());
        assert!(reg.list_rooms().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn join_missing_room_reports_and_stays_idle() {
        let reg = registry();
        let mut s = SessionState::new();
        let err = enter(&mut s, &reg, "Bob", "ghost", EntryMode::Join).await.err().unwrap();
        assert!(matches!(err, EntryError::RoomNotFound(ref id) if id == "ghost"));
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn full_room_admits_as_participant() -> Result<()> {
        let reg = registry();
        reg.create_room("r", "A", false).await?;
        reg.join_room("r", "B").await?;
        reg.join_room("r", "C").await?;
        let mut s = SessionState::new();
        let m = enter(&mut s, &reg, "D", "r", EntryMode::Join).await?;
        assert_eq!(s.phase(), Phase::Active);
        assert!(!s.is_admin);
        exit(&mut s, m).await?;
        assert_eq!(reg.find("r").await?.unwrap().admins, vec!["A", "B", "C"]);
        Ok(())
    }

    #[tokio::test]
    async fn dropped_membership_still_leaves() -> Result<()> {
        let reg = registry();
        let mut s = SessionState::new();
        let m = enter(&mut s, &reg, "Alice", "r", EntryMode::Create { is_private: true }).await?;
        drop(m);
        for _ in 0..50 {
            if reg.list_rooms().await?.is_empty() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        panic!("room still listed after membership drop");
    }

    #[tokio::test]
    async fn exit_lowers_raised_hand() -> Result<()> {
        let reg = registry();
        let mut s = SessionState::new();
        let m = enter(&mut s, &reg, "Alice", "r", EntryMode::Create { is_private: false }).await?;
        reg.join_room("r", "Bob").await?;
        reg.raise_hand("r", "Alice").await?;
        exit(&mut s, m).await?;
        assert!(reg.raised_hands("r").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn guest_exit_lowers_raised_hand() -> Result<()> {
        let reg = registry();
        reg.create_room("r", "A", false).await?;
        reg.join_room("r", "B").await?;
        reg.join_room("r", "C").await?;
        let mut s = SessionState::new();
        let m = enter(&mut s, &reg, "D", "r", EntryMode::Join).await?;
        assert!(!s.is_admin);
        reg.raise_hand("r", "D").await?;
        assert_eq!(reg.raised_hands("r").await?, vec!["D"]);
        exit(&mut s, m).await?;
        assert!(reg.raised_hands("r").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_membership_lowers_hand() -> Result<()> {
        let reg = registry();
        reg.create_room("r", "A", false).await?;
        let mut s = SessionState::new();
        let m = enter(&mut s, &reg, "B", "r", EntryMode::Join).await?;
        reg.raise_hand("r", "B").await?;
        drop(m);
        for _ in 0..50 {
            if reg.raised_hands("r").await?.is_empty() {
                assert_eq!(reg.find("r").await?.unwrap().admins, vec!["A"]);
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
        panic!("hand still raised after membership drop");
    }

    #[test]
    fn denied_camera_keeps_prior_state() {
        let mut s = SessionState::new();
        assert!(s.is_camera_off());
        assert!(s.toggle_camera(&no_devices()).is_err());
        assert!(s.is_camera_off());
        assert!(s.toggle_screen_share(&no_devices()).is_err());
        assert!(!s.is_sharing_screen());
    }

    #[test]
    fn camera_toggles_with_device() {
        let cap = DeviceCapture {
            camera_path: PathBuf::from("/dev/null"),
            allow_screen: true,
        };
        let mut s = SessionState::new();
        assert!(s.toggle_camera(&cap).unwrap());
        assert!(!s.is_camera_off());
        assert!(!s.toggle_camera(&cap).unwrap());
        assert!(s.is_camera_off());
        assert!(s.toggle_screen_share(&cap).unwrap());
        assert!(s.is_sharing_screen());
    }

    #[test]
    fn pure_flags_flip() {
        let mut s = SessionState::new();
        assert!(s.toggle_mute());
        assert!(!s.toggle_mute());
        assert!(s.toggle_hand());
    }

    #[test]
    fn blank_chat_is_dropped() {
        let mut s = SessionState::new();
        assert!(!s.add_message("Alice", "   "));
        assert!(s.add_message("Alice", " hi "));
        assert_eq!(s.transcript()[0].text, "hi");
    }

    #[test]
    fn meeting_log_layout() {
        let mut s = SessionState::new();
        s.activate("weekly-standup", true);
        let t = Local.with_ymd_and_hms(2026, 3, 4, 9, 5, 0).unwrap();
        s.push_message("Alice", "morning", t);
        s.push_message("Bob", "hey", t);
        let date = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        let log = s.meeting_log(&["Alice".into(), "Bob".into()], date);
        assert_eq!(
            log,
            "=== MEETING LOG ===\nRoom: weekly-standup\nDate: 2026-03-04\nAdmins: Alice, Bob\n\
             ----------------------------\n\n[09:05] Alice: morning\n[09:05] Bob: hey"
        );
    }

    #[test]
    fn log_file_name_is_sanitized() {
        assert_eq!(file_safe("a/b..c"), "a_b__c");
        assert_eq!(file_safe("weekly-standup"), "weekly-standup");
    }
}
