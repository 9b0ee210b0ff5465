//! Ephemeral key-value store with per-key expiry.
//!
//! Every operation touches a single key and is atomic on its own. Nothing
//! in the crate relies on multi-key transactions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write `value` with a fresh expiry of `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Write `value` without expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Overwrite an existing key, keeping its remaining expiry.
    /// Returns false when the key is absent.
    async fn set_keep_ttl(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Remaining time to live; `None` when absent or persistent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn incr(&self, key: &str) -> StoreResult<i64>;

    async fn decr(&self, key: &str) -> StoreResult<i64>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => at > now,
            None => true,
        }
    }
}

/// In-process store. Expiry is lazy and follows the tokio clock, so tests
/// can drive it with `tokio::time::pause`/`advance`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> R) -> R {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }

    fn add(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });
            let current: i64 = entry.value.parse().map_err(|_| StoreError::NotAnInteger {
                key: key.to_string(),
            })?;
            let next = current + delta;
            entry.value = next.to_string();
            Ok(next)
        })
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.with_entries(|entries, _| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        });
        Ok(())
    }

    async fn set_keep_ttl(&self, key: &str, value: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries, _| match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                true
            }
            None => false,
        }))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        Ok(self.with_entries(|entries, now| {
            entries
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now))
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries, _| entries.contains_key(key)))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_entries(|entries, _| entries.remove(key).is_some()))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.add(key, -1)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.with_entries(|entries, _| {
            let mut keys: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            keys.sort();
            keys
        }))
    }
}
