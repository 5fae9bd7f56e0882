//! Key-value store interface.
//!
//! The distributed KV deployment (multi-replica buffers, session mirror) is
//! an external collaborator; the core consumes only this trait. The bundled
//! in-memory implementation backs tests and single-replica deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, replacing any previous one. `ttl` of `None` never expires.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically append `value` to the list at `key`, evict oldest entries
    /// beyond `cap`, and refresh the key's TTL. Insertion order is preserved.
    async fn list_push_trim(
        &self,
        key: &str,
        value: String,
        cap: usize,
        ttl: Duration,
    ) -> Result<()>;

    async fn list_get(&self, key: &str) -> Result<Vec<String>>;
}

// ── In-memory implementation ───────────────────────────

enum Entry {
    Value(String),
    List(Vec<String>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut slots = self.slots.lock().await;
        match slots.get(key) {
            Some(slot) if slot.expired() => {
                slots.remove(key);
                Ok(None)
            }
            Some(Slot { entry: Entry::Value(v), .. }) => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut slots = self.slots.lock().await;
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.slots.lock().await.remove(key);
        Ok(())
    }

    async fn list_push_trim(
        &self,
        key: &str,
        value: String,
        cap: usize,
        ttl: Duration,
    ) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let expires_at = Some(Instant::now() + ttl);

        // Expired or non-list slots start over as an empty list
        let needs_reset = match slots.get(key) {
            Some(slot) if !slot.expired() => !matches!(slot.entry, Entry::List(_)),
            _ => true,
        };
        if needs_reset {
            slots.insert(
                key.to_string(),
                Slot { entry: Entry::List(Vec::new()), expires_at },
            );
        }

        if let Some(slot) = slots.get_mut(key) {
            slot.expires_at = expires_at;
            if let Entry::List(list) = &mut slot.entry {
                list.push(value);
                if list.len() > cap {
                    let overflow = list.len() - cap;
                    list.drain(..overflow);
                }
            }
        }
        Ok(())
    }

    async fn list_get(&self, key: &str) -> Result<Vec<String>> {
        let mut slots = self.slots.lock().await;
        match slots.get(key) {
            Some(slot) if slot.expired() => {
                slots.remove(key);
                Ok(Vec::new())
            }
            Some(Slot { entry: Entry::List(list), .. }) => Ok(list.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_trim_preserves_order_and_cap() {
        let kv = MemoryKvStore::new();
        for i in 0..5 {
            kv.list_push_trim("k", format!("m{i}"), 3, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let list = kv.list_get("k").await.unwrap();
        assert_eq!(list, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let kv = MemoryKvStore::new();
        kv.set("k", "v".to_string(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
