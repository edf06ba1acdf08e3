mod ui;
mod input;
mod data;
mod kv;
mod media;
mod presence;
mod realtime;
mod rooms;
mod session;
mod nick;
mod util;
#[cfg(test)]
mod it_db;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::kv::{ContextId, KeyValueStore, MemoryStore};
use crate::media::DeviceCapture;
use crate::rooms::{RoomRegistry, DEFAULT_ADMIN_CAP};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cfg = Config::from_env()?;
    init_tracing(&cfg.trace_file)?;

    let origin = ContextId::random();
    info!(%origin, store = ?cfg.store, admin_cap = ?cfg.admin_cap, "booting meet-tui");

    let store: Arc<dyn KeyValueStore> = match cfg.store {
        StoreKind::Postgres => {
            let url = cfg
                .database_url
                .as_deref()
                .context("DATABASE_URL is required")?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("connect postgres")?;
            sqlx::migrate!().run(&pool).await.context("run migrations")?;
            let store = data::PgStore::new(pool);
            realtime::spawn_listener(store.pool().clone(), store.event_sender());
            Arc::new(store)
        }
        StoreKind::Memory => {
            warn!("memory store: rooms are not shared with other processes");
            Arc::new(MemoryStore::new())
        }
    };

    let (sig_tx, sig_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let name = wait_for_signal().await;
        let _ = sig_tx.send(name).await;
    });

    let app = ui::App {
        registry: RoomRegistry::new(store, origin, cfg.admin_cap),
        capture: Box::new(DeviceCapture {
            camera_path: cfg.camera_device,
            allow_screen: cfg.screen_share,
        }),
        log_dir: cfg.log_dir,
        default_user: cfg.default_user,
    };
    ui::run(app, sig_rx).await?;
    info!("bye");
    Ok(())
}

fn init_tracing(path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open trace file {}", path.display()))?;
    let env = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("info".parse().unwrap_or_default());
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_writer(Mutex::new(file))
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut term), Ok(mut hup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        let _ = tokio::signal::ctrl_c().await;
        return "interrupt";
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupt",
        _ = term.recv() => "terminate",
        _ = hup.recv() => "hangup",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKind {
    Postgres,
    Memory,
}

struct Config {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub admin_cap: Option<usize>,
    pub default_user: String,
    pub log_dir: PathBuf,
    pub camera_device: PathBuf,
    pub screen_share: bool,
    pub trace_file: PathBuf,
}

impl Config {
    fn from_env() -> Result<Self> {
        let store = match std::env::var("MEET_STORE").ok().as_deref() {
            None | Some("postgres") | Some("pg") => StoreKind::Postgres,
            Some("memory") => StoreKind::Memory,
            Some(other) => bail!("unknown MEET_STORE {other:?}"),
        };
        let database_url = std::env::var("DATABASE_URL").ok();
        let admin_cap = parse_admin_cap(std::env::var("MEET_ADMIN_CAP").ok().as_deref());
        let default_user = std::env::var("MEET_USER").unwrap_or_default();
        let log_dir = std::env::var("MEET_LOG_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."));
        let camera_device = std::env::var("MEET_CAMERA_DEVICE").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/dev/video0"));
        let screen_share = std::env::var("MEET_SCREEN_SHARE").ok().map(|v| parse_flag(&v)).unwrap_or(false);
        let trace_file = std::env::var("MEET_TRACE_FILE").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("meet-tui.log"));
        Ok(Self { store, database_url, admin_cap, default_user, log_dir, camera_device, screen_share, trace_file })
    }
}

fn parse_admin_cap(v: Option<&str>) -> Option<usize> {
    match v.map(str::trim) {
        None | Some("") => Some(DEFAULT_ADMIN_CAP),
        Some("none") | Some("0") => None,
        Some(n) => Some(n.parse().unwrap_or(DEFAULT_ADMIN_CAP)),
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
