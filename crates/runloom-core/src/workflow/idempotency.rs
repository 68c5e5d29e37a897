//! Idempotency keys, slim results and per-key serialization.
//!
//! An action's key is the SHA-256 of `(run_id, node_key, rendered args)`,
//! so two payloads that fill the same template differently never collide.
//! Results are slimmed before caching to bound storage per entry.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Strings longer than this are cut when slimming.
pub const SLIM_STRING_CHARS: usize = 1024;

/// Arrays longer than this are cut when slimming.
pub const SLIM_ARRAY_ITEMS: usize = 50;

/// Length of `_preview` in a fully truncated result.
pub const SLIM_PREVIEW_CHARS: usize = 512;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Deterministic idempotency key, hex encoded.
pub fn idempotency_key(run_id: &Uuid, node_key: &str, rendered_args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(node_key.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(rendered_args).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Slim results
// ---------------------------------------------------------------------------

/// Size-bounded projection of a provider result.
///
/// Values whose serialized form fits in `max_bytes` are kept as-is.
/// Otherwise long strings and arrays are cut; if that is still too large
/// the value is replaced by a `_truncated` marker with a short preview.
pub fn slim_result(value: &Value, max_bytes: usize) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= max_bytes {
        return value.clone();
    }

    let shrunk = shrink(value);
    if shrunk.to_string().len() <= max_bytes {
        tracing::debug!(
            original_size = serialized.len(),
            max = max_bytes,
            "result slimmed"
        );
        return shrunk;
    }

    tracing::debug!(
        original_size = serialized.len(),
        max = max_bytes,
        "result truncated"
    );
    json!({
        "_truncated": true,
        "_original_size": serialized.len(),
        "_preview": serialized.chars().take(SLIM_PREVIEW_CHARS).collect::<String>(),
    })
}

fn shrink(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > SLIM_STRING_CHARS => {
            Value::String(s.chars().take(SLIM_STRING_CHARS).collect())
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(SLIM_ARRAY_ITEMS)
                .map(shrink)
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), shrink(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Per-key locks
// ---------------------------------------------------------------------------

/// In-process mutexes keyed by idempotency key.
///
/// Serializes concurrent attempts on the same key so the second waits for
/// the first to populate the cache instead of calling the provider again.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the entry for `key` once nobody holds or waits on it.
    pub fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
