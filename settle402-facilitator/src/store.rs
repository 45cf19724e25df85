//! Key-value store capability backing the facilitator directory.
//!
//! The directory only needs plain string values plus string sets, the
//! subset shared by Redis-style stores. [`MemoryStore`] is the in-process
//! implementation used by the binary and by tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

/// Errors reported by a store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not complete the operation.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value could not be decoded.
    #[error("corrupt value at `{key}`: {reason}")]
    Corrupt {
        /// Key holding the value.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

/// Persistent key-value store with set membership.
///
/// Reads are lock-free from the caller's point of view; writes are
/// last-writer-wins per key.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a value, replacing any previous one.
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Deletes a value. Returns `true` if it existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Reads several values at once, in key order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Adds `member` to the set at `key`. Returns `true` if it was new.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Removes `member` from the set at `key`. Returns `true` if it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Lists the members of the set at `key`, sorted.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory [`KeyValueStore`] backed by [`DashMap`]. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, String>,
    sets: DashMap<String, BTreeSet<String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of value writes performed so far.
    ///
    /// Set operations are not counted.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.values.insert(key.to_owned(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.remove(key).is_some())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(keys
            .iter()
            .map(|key| self.values.get(key).map(|v| v.value().clone()))
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .get_mut(key)
            .is_some_and(|mut set| set.remove(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_and_write_count() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.set("a", "1".into()).await.unwrap();
        store.set("b", "2".into()).await.unwrap();
        assert_eq!(store.write_count(), 2);
        let got = store
            .multi_get(&["b".into(), "missing".into(), "a".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("2".into()), None, Some("1".into())]);
        assert!(store.del("a").await.unwrap());
        assert!(!store.del("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_membership() {
        let store = MemoryStore::new();
        assert!(store.set_add("s", "y").await.unwrap());
        assert!(store.set_add("s", "x").await.unwrap());
        assert!(!store.set_add("s", "x").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["x", "y"]);
        assert!(store.set_remove("s", "x").await.unwrap());
        assert!(!store.set_remove("nope", "x").await.unwrap());
        assert_eq!(store.set_members("s").await.unwrap(), vec!["y"]);
        assert!(store.set_members("empty").await.unwrap().is_empty());
    }
}
