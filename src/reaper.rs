use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{now_ms, Engine};

/// Periodically drops reservation holds that expired more than `retention` ago.
/// Expired holds stop blocking slots the moment they lapse; the sweep only
/// reclaims memory and log space.
pub async fn run_sweeper(engine: Arc<Engine>, retention: Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine, retention).await;
    }
}

async fn sweep_once(engine: &Engine, retention: Duration) -> usize {
    let cutoff = now_ms() - retention.as_millis() as i64;
    let purged = engine.purge_released_reservations(cutoff).await;
    if purged > 0 {
        info!("swept {purged} expired reservations");
        metrics::counter!(crate::observability::RESERVATIONS_SWEPT_TOTAL).increment(purged as u64);
    }
    purged
}

/// Rewrites the WAL once it has grown `threshold` appends past the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_user_event(name: &str) -> (Arc<Engine>, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap());
        let user = User {
            id: Ulid::new(),
            username: "ada".into(),
            default_schedule_id: None,
        };
        engine.create_user(user.clone()).await.unwrap();
        let et = EventType::new(Ulid::new(), "intro", Owner::User(user.id), 30);
        engine.create_event_type(et.clone()).await.unwrap();
        (engine, et.id)
    }

    #[tokio::test]
    async fn sweeper_keeps_holds_inside_retention() {
        let (engine, et_id) = engine_with_user_event("sweep_retention.wal").await;
        let now = now_ms();
        let start = now + 86_400_000;
        let r = engine
            .reserve_slot_at(
                ReserveSlotInput {
                    event_type_id: et_id,
                    slot_start: start,
                    slot_duration: None,
                    reservation_duration: None,
                },
                None,
                now - 10 * MINUTE_MS,
            )
            .await
            .unwrap();

        // Lapsed five minutes ago; an hour of retention keeps it.
        assert_eq!(sweep_once(&engine, Duration::from_secs(3600)).await, 0);
        assert!(engine.get_reservation(r.uid).is_ok());

        assert_eq!(sweep_once(&engine, Duration::ZERO).await, 1);
        assert!(engine.get_reservation(r.uid).is_err());
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let (engine, _) = engine_with_user_event("compact_threshold.wal").await;
        assert_eq!(engine.wal_appends_since_compact().await, 2);

        assert!(!compact_if_needed(&engine, 10).await);
        assert!(compact_if_needed(&engine, 2).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
