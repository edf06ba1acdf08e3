use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::debug;

use crate::kv::{ContextId, KeyValueStore, StorageEvent, EVENT_BUFFER};

pub const NOTIFY_CHANNEL: &str = "kv_changes";

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub key: String,
    pub origin: ContextId,
}

/// Postgres-backed store. Each mutation commits together with a
/// `pg_notify` so every connected client learns about it.
pub struct PgStore {
    pool: PgPool,
    events: broadcast::Sender<StorageEvent>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { pool, events }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Sender the realtime listener republishes notifications into.
    pub fn event_sender(&self) -> broadcast::Sender<StorageEvent> {
        self.events.clone()
    }

    async fn notify(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        key: &str,
        origin: ContextId,
    ) -> Result<()> {
        let payload = serde_json::to_string(&NotifyPayload {
            key: key.to_string(),
            origin,
        })?;
        sqlx::query("select pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("select value from kv_entries where key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("read {key}"))?;
        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &str, origin: ContextId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"insert into kv_entries(key, value) values($1,$2)
               on conflict(key)
               do update set value = excluded.value, updated_at = now()"#,
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("write {key}"))?;
        Self::notify(&mut tx, key, origin).await?;
        tx.commit().await?;
        debug!(key, %origin, "kv set");
        Ok(())
    }

    async fn remove(&self, key: &str, origin: ContextId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query("delete from kv_entries where key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("delete {key}"))?;
        if res.rows_affected() > 0 {
            Self::notify(&mut tx, key, origin).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape() {
        let p = NotifyPayload {
            key: "meet.active_rooms".into(),
            origin: ContextId(42),
        };
        let s = serde_json::to_string(&p).unwrap();
        assert_eq!(s, r#"{"key":"meet.active_rooms","origin":42}"#);
    }
}
