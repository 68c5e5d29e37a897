//! Idempotency cache trait definition.

use std::time::Duration;

use runloom_types::error::RepositoryError;
use serde_json::Value;

/// Key -> slim action result, with per-entry expiry.
pub trait IdempotencyCache: Send + Sync {
    /// Get the live entry for `key`. Expired entries are treated as absent.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Store `value` under `key` for `ttl` unless a live entry already exists.
    /// Returns `true` if this call wrote the entry.
    fn put(
        &self,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
