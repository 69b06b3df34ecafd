//! Concurrent keyed store
//!
//! Used both as the per-cluster client cache and as the deletion watch set.
//! Every operation holds the lock for its whole duration, so a lookup
//! followed by an insert can not interleave with another writer.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use tokio::sync::Mutex;

/// Mutex-guarded map with get-or-insert and snapshot operations
#[derive(Debug)]
pub struct KeyedStore<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for KeyedStore<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Insert a value, returning the one it replaced
    pub async fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.lock().await.insert(key, value)
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().await.remove(key)
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Keep only the entries `keep` accepts
    pub async fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.entries.lock().await.retain(|k, v| keep(k, v));
    }

    /// Copy of every entry at one point in time
    pub async fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Return the stored value or build, store and return a new one.
    ///
    /// The lock is held while `factory` runs, so concurrent callers for an
    /// absent key wait for the first construction instead of racing it. A
    /// failed construction stores nothing.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(value) = entries.get(&key) {
            return Ok(value.clone());
        }

        let value = factory().await?;
        entries.insert(key, value.clone());
        Ok(value)
    }
}
