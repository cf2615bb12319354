use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use typerace_shared::types::{RaceId, RaceResultSet};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("could not encode result set: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for committed race results (match history, leaderboards).
/// Commits are keyed by race id; repeating one must be a no-op.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn commit(&self, set: &RaceResultSet) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    sets: DashMap<RaceId, RaceResultSet>,
}

impl MemoryResultStore {
    pub fn get(&self, race_id: &str) -> Option<RaceResultSet> {
        self.sets.get(race_id).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn commit(&self, set: &RaceResultSet) -> Result<(), StoreError> {
        self.sets
            .entry(set.race_id.clone())
            .or_insert_with(|| set.clone());
        Ok(())
    }
}

pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn commit(&self, set: &RaceResultSet) -> Result<(), StoreError> {
        let payload = serde_json::to_string(set)?;
        sqlx::query(
            r#"INSERT INTO race_results (race_id, room_code, payload) VALUES ($1, $2, $3)
                ON CONFLICT (race_id) DO NOTHING"#,
        )
        .bind(&set.race_id)
        .bind(set.room_code.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Commits with exponential backoff, giving up after `attempts` tries.
pub async fn commit_with_retry(
    store: Arc<dyn ResultStore>,
    set: Arc<RaceResultSet>,
    attempts: u32,
) -> bool {
    let mut delay = Duration::from_millis(200);
    for attempt in 1..=attempts.max(1) {
        match store.commit(&set).await {
            Ok(()) => {
                info!(race_id = %set.race_id, room = %set.room_code, attempt, "results committed");
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!(race_id = %set.race_id, attempt, "results commit failed: {e}");
                sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                error!(race_id = %set.race_id, attempt, "giving up on results commit: {e}");
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use typerace_shared::types::{Difficulty, RoomCode};

    fn set(race_id: &str) -> RaceResultSet {
        RaceResultSet {
            race_id: race_id.into(),
            room_code: RoomCode::parse("ABCD12").unwrap(),
            passage_id: "1".into(),
            difficulty: Difficulty::Easy,
            duration: 60,
            results: Vec::new(),
            committed_at_ms: 1,
        }
    }

    struct Flaky {
        failures_left: AtomicU32,
        inner: MemoryResultStore,
    }

    #[async_trait]
    impl ResultStore for Flaky {
        async fn commit(&self, set: &RaceResultSet) -> Result<(), StoreError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.commit(set).await
        }
    }

    #[tokio::test]
    async fn test_memory_store_is_write_once() {
        let store = MemoryResultStore::default();
        store.commit(&set("r1")).await.unwrap();

        let mut changed = set("r1");
        changed.committed_at_ms = 99;
        store.commit(&changed).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("r1").unwrap().committed_at_ms, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            inner: MemoryResultStore::default(),
        });
        assert!(commit_with_retry(flaky.clone(), Arc::new(set("r2")), 5).await);
        assert!(flaky.inner.get("r2").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            inner: MemoryResultStore::default(),
        });
        assert!(!commit_with_retry(flaky.clone(), Arc::new(set("r3")), 3).await);
        assert!(flaky.inner.is_empty());
    }
}
