//! Second-tier cache staging. Writes and clears a session performs are held
//! back per cache and only reach the shared cache at commit; rollback
//! discards them and releases any blocking-cache locks taken by misses.

use crate::cache::{Cache, CacheKey};
use crate::Result;
use driver::Value;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct TransactionalCache {
    delegate: Arc<dyn Cache>,
    clear_on_commit: bool,
    entries_to_add: HashMap<CacheKey, Arc<Value>>,
    entries_missed: HashSet<CacheKey>,
}

impl TransactionalCache {
    fn new(delegate: Arc<dyn Cache>) -> TransactionalCache {
        TransactionalCache {
            delegate,
            clear_on_commit: false,
            entries_to_add: HashMap::new(),
            entries_missed: HashSet::new(),
        }
    }

    fn get(&mut self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        let found = self.delegate.get(key)?;
        if found.is_none() {
            self.entries_missed.insert(key.clone());
        }
        // a pending clear hides everything the shared cache still holds
        if self.clear_on_commit {
            return Ok(None);
        }
        Ok(found)
    }

    fn put(&mut self, key: CacheKey, value: Arc<Value>) {
        self.entries_to_add.insert(key, value);
    }

    fn clear(&mut self) {
        self.clear_on_commit = true;
        self.entries_to_add.clear();
    }

    fn commit(&mut self) -> Result<()> {
        if self.clear_on_commit {
            self.delegate.clear()?;
        }
        self.flush_pending()?;
        self.reset();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.unlock_missed();
        self.reset();
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        for (key, value) in self.entries_to_add.drain() {
            self.entries_missed.remove(&key);
            self.delegate.put(key, value)?;
        }
        // misses that were never satisfied are published as explicit nulls
        // so blocking-cache locks taken by the failed reads are released
        for key in self.entries_missed.drain() {
            self.delegate.put(key, Arc::new(Value::Null))?;
        }
        Ok(())
    }

    fn unlock_missed(&mut self) {
        for key in self.entries_missed.drain() {
            if let Err(e) = self.delegate.remove(&key) {
                debug!(
                    "could not release lock on cache [{}]: {e}",
                    self.delegate.id()
                );
            }
        }
    }

    fn reset(&mut self) {
        self.clear_on_commit = false;
        self.entries_to_add.clear();
        self.entries_missed.clear();
    }
}

/// Per-session registry of staged caches, keyed by cache id.
#[derive(Default)]
pub struct TransactionalCacheManager {
    caches: HashMap<String, TransactionalCache>,
}

impl TransactionalCacheManager {
    pub fn new() -> TransactionalCacheManager {
        TransactionalCacheManager::default()
    }

    fn staged(&mut self, cache: &Arc<dyn Cache>) -> &mut TransactionalCache {
        self.caches
            .entry(cache.id().to_string())
            .or_insert_with(|| TransactionalCache::new(cache.clone()))
    }

    pub fn get(&mut self, cache: &Arc<dyn Cache>, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.staged(cache).get(key)
    }

    pub fn put(&mut self, cache: &Arc<dyn Cache>, key: CacheKey, value: Arc<Value>) {
        self.staged(cache).put(key, value);
    }

    pub fn clear(&mut self, cache: &Arc<dyn Cache>) {
        self.staged(cache).clear();
    }

    pub fn commit(&mut self) -> Result<()> {
        for cache in self.caches.values_mut() {
            cache.commit()?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        for cache in self.caches.values_mut() {
            cache.rollback()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use crate::cache::PerpetualCache;
    use serde_json::json;

    fn key(n: i64) -> CacheKey {
        let mut k = CacheKey::new();
        k.update(json!(n));
        k
    }

    fn shared() -> Arc<dyn Cache> {
        Arc::new(PerpetualCache::new("ns"))
    }

    #[test]
    fn writes_invisible_until_commit() {
        let cache = shared();
        let mut tcm = TransactionalCacheManager::new();
        tcm.put(&cache, key(1), Arc::new(json!("v")));
        assert!(cache.get(&key(1)).unwrap().is_none());
        tcm.commit().unwrap();
        assert_eq!(cache.get(&key(1)).unwrap().unwrap().as_ref(), &json!("v"));
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let cache = shared();
        let mut tcm = TransactionalCacheManager::new();
        tcm.put(&cache, key(1), Arc::new(json!("v")));
        tcm.rollback().unwrap();
        tcm.commit().unwrap();
        assert!(cache.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn staged_clear_hides_existing_entries_and_applies_on_commit() {
        let cache = shared();
        cache.put(key(1), Arc::new(json!("old"))).unwrap();
        let mut tcm = TransactionalCacheManager::new();
        tcm.clear(&cache);
        assert!(tcm.get(&cache, &key(1)).unwrap().is_none());
        // other sessions still see the entry before commit
        assert!(cache.get(&key(1)).unwrap().is_some());
        tcm.commit().unwrap();
        assert!(cache.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn unsatisfied_misses_publish_null_on_commit() {
        let cache = shared();
        let mut tcm = TransactionalCacheManager::new();
        assert!(tcm.get(&cache, &key(9)).unwrap().is_none());
        tcm.commit().unwrap();
        let published = cache.get(&key(9)).unwrap().unwrap();
        assert!(published.is_null());
    }
}
