//! SQLite idempotency cache.
//!
//! Entries carry an absolute expiry in epoch milliseconds. `put` only
//! replaces an entry that has already expired, so the first writer of a live
//! key wins across processes sharing the database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runloom_core::repository::IdempotencyCache;
use runloom_types::error::RepositoryError;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::pool::DatabasePool;

/// Shortest gap between background purges.
const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct SqliteIdempotencyCache {
    pool: DatabasePool,
}

impl SqliteIdempotencyCache {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM idempotency_cache WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Run `purge_expired` every `every` (first pass immediately) until the
    /// returned handle is aborted.
    pub fn spawn_purge_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "purged expired idempotency entries"),
                    Err(e) => tracing::warn!(error = %e, "failed to purge idempotency cache"),
                }
            }
        })
    }
}

/// Purge cadence for a cache whose entries live `ttl_secs`: a twenty-fourth
/// of the TTL, never more often than once a minute.
pub fn purge_interval(ttl_secs: u64) -> Duration {
    Duration::from_secs(ttl_secs / 24).max(MIN_PURGE_INTERVAL)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl IdempotencyCache for SqliteIdempotencyCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM idempotency_cache WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        value
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("invalid cached JSON: {e}")))
    }

    async fn put(&self, key: &str, value: &Value, ttl: Duration) -> Result<bool, RepositoryError> {
        let now = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);
        let value_str = serde_json::to_string(value)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize value: {e}")))?;

        let result = sqlx::query(
            r#"INSERT INTO idempotency_cache (key, value, expires_at) VALUES (?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
               WHERE idempotency_cache.expires_at <= ?"#,
        )
        .bind(key)
        .bind(&value_str)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn cache(dir: &tempfile::TempDir) -> SqliteIdempotencyCache {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("cache.db").display());
        SqliteIdempotencyCache::new(DatabasePool::new(&url).await.unwrap())
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir).await;

        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache
            .put("k", &json!({ "id": "m1" }), Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(json!({ "id": "m1" })));
    }

    #[tokio::test]
    async fn test_live_entry_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir).await;

        cache.put("k", &json!(1), Duration::from_secs(60)).await.unwrap();
        assert!(!cache.put("k", &json!(2), Duration::from_secs(60)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_expired_entry_is_invisible_and_replaceable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir).await;

        cache.put("k", &json!(1), Duration::ZERO).await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.put("k", &json!(2), Duration::from_secs(60)).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir).await;

        cache.put("old", &json!(1), Duration::ZERO).await.unwrap();
        cache.put("new", &json!(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.purge_expired().await.unwrap(), 1);
        assert_eq!(cache.get("new").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_purge_task_removes_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(cache(&dir).await);

        cache.put("old", &json!(1), Duration::ZERO).await.unwrap();
        cache.put("new", &json!(2), Duration::from_secs(60)).await.unwrap();

        let task = Arc::clone(&cache).spawn_purge_task(Duration::from_millis(20));
        let mut remaining = i64::MAX;
        for _ in 0..50 {
            remaining = sqlx::query_scalar("SELECT COUNT(*) FROM idempotency_cache")
                .fetch_one(&cache.pool.reader)
                .await
                .unwrap();
            if remaining == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        task.abort();

        assert_eq!(remaining, 1);
        assert_eq!(cache.get("new").await.unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_purge_interval() {
        assert_eq!(purge_interval(86_400), Duration::from_secs(3_600));
        assert_eq!(purge_interval(60), MIN_PURGE_INTERVAL);
        assert_eq!(purge_interval(0), MIN_PURGE_INTERVAL);
    }
}
