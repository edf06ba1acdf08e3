#[cfg(test)]
mod it_db {
    use crate::data::PgStore;
    use crate::kv::{ContextId, KeyValueStore};
    use crate::presence::PresenceSync;
    use crate::realtime;
    use crate::rooms::RoomRegistry;
    use rand::Rng;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn remote_create_and_leave_propagate() -> anyhow::Result<()> {
        // Skip if DATABASE_URL not set
        let database_url = match std::env::var("DATABASE_URL") {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };

        let pool = PgPoolOptions::new().max_connections(5).connect(&database_url).await?;
        sqlx::migrate!().run(&pool).await?;

        // Two clients, each with its own listener connection
        let store_a = PgStore::new(pool.clone());
        let store_b = PgStore::new(pool.clone());
        realtime::spawn_listener(pool.clone(), store_b.event_sender());
        let store_a: Arc<dyn KeyValueStore> = Arc::new(store_a);
        let store_b: Arc<dyn KeyValueStore> = Arc::new(store_b);
        let a = RoomRegistry::new(store_a, ContextId::random(), Some(3));
        let b = RoomRegistry::new(store_b, ContextId::random(), Some(3));

        let mut sync_b = PresenceSync::attach(b).await?;
        // give the listener time to LISTEN before the first write
        tokio::time::sleep(Duration::from_millis(300)).await;

        let room_name = format!("it-{:08x}", rand::thread_rng().gen::<u32>());
        a.create_room(&room_name, "alice", false).await?;
        timeout(Duration::from_secs(5), sync_b.changed()).await??;
        assert!(sync_b.rooms().iter().any(|r| r.id == room_name));

        // Leave twice: same observable state
        a.leave_room(&room_name, "alice").await?;
        timeout(Duration::from_secs(5), sync_b.changed()).await??;
        assert!(!sync_b.rooms().iter().any(|r| r.id == room_name));
        a.leave_room(&room_name, "alice").await?;
        sync_b.refresh().await?;
        assert!(!sync_b.rooms().iter().any(|r| r.id == room_name));
        Ok(())
    }
}
