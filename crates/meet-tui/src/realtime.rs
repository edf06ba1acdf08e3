// LISTEN/NOTIFY loop feeding the store's change feed
use anyhow::Result;
use sqlx::{postgres::PgListener, PgPool};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::{debug, warn};

use crate::data::{NotifyPayload, NOTIFY_CHANNEL};
use crate::kv::StorageEvent;

pub fn spawn_listener(pool: PgPool, tx: broadcast::Sender<StorageEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff_secs = 1u64;
        loop {
            match run_once(&pool, &tx).await {
                Ok(_) => {
                    backoff_secs = 1;
                }
                Err(e) => {
                    let d = backoff_secs.min(30);
                    warn!(error = %e, retry_in = d, "notify listener dropped");
                    sleep(Duration::from_secs(d)).await;
                    backoff_secs = next_backoff(backoff_secs);
                }
            }
        }
    })
}

fn next_backoff(secs: u64) -> u64 {
    (secs * 2).min(30)
}

async fn run_once(pool: &PgPool, tx: &broadcast::Sender<StorageEvent>) -> Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    debug!("listening on {}", NOTIFY_CHANNEL);
    loop {
        let n = listener.recv().await?;
        if let Some(ev) = decode(n.payload()) {
            let _ = tx.send(ev);
        }
    }
}

fn decode(payload: &str) -> Option<StorageEvent> {
    let p = serde_json::from_str::<NotifyPayload>(payload).ok()?;
    Some(StorageEvent {
        key: p.key,
        origin: p.origin,
    })
}
