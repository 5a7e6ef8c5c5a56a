use crate::cache::{Cache, CacheKey};
use crate::Result;
use constants::{DEFAULT_SOFT_HARD_LINKS, DEFAULT_WEAK_HARD_LINKS};
use driver::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

/// The innermost store: a plain locked hash map.
pub struct PerpetualCache {
    id: String,
    entries: Mutex<HashMap<CacheKey, Arc<Value>>>,
}

impl PerpetualCache {
    pub fn new(id: &str) -> PerpetualCache {
        PerpetualCache {
            id: id.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Cache for PerpetualCache {
    fn id(&self) -> &str {
        &self.id
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.entries.lock().unwrap().insert(key, value);
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        Ok(self.entries.lock().unwrap().remove(key))
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

// Weak-reference store: entries stay alive only while something else holds
// the Arc, or while they sit in the bounded hard-reference queue. Dead weak
// entries are purged on every mutating operation.
struct ReferenceStore {
    id: String,
    entries: Mutex<HashMap<CacheKey, Weak<Value>>>,
    hard_links: Mutex<VecDeque<Arc<Value>>>,
    hard_link_count: usize,
    retain_on_read: bool,
}

impl ReferenceStore {
    fn sweep(&self) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, weak| weak.strong_count() > 0);
    }

    fn retain_hard(&self, value: &Arc<Value>) {
        let mut hard = self.hard_links.lock().unwrap();
        hard.push_back(value.clone());
        if hard.len() > self.hard_link_count {
            hard.pop_front();
        }
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.sweep();
        self.retain_hard(&value);
        self.entries.lock().unwrap().insert(key, Arc::downgrade(&value));
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        let found = self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(Weak::upgrade);
        if let Some(value) = &found {
            if self.retain_on_read {
                self.retain_hard(value);
            }
        }
        Ok(found)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.sweep();
        Ok(self
            .entries
            .lock()
            .unwrap()
            .remove(key)
            .and_then(|weak| weak.upgrade()))
    }

    fn clear(&self) -> Result<()> {
        self.hard_links.lock().unwrap().clear();
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn size(&self) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Weak store: reads do not protect entries from collection.
pub struct WeakCache(ReferenceStore);

impl WeakCache {
    pub fn new(id: &str) -> WeakCache {
        WeakCache::with_hard_links(id, DEFAULT_WEAK_HARD_LINKS)
    }

    pub fn with_hard_links(id: &str, hard_link_count: usize) -> WeakCache {
        WeakCache(ReferenceStore {
            id: id.to_string(),
            entries: Mutex::new(HashMap::new()),
            hard_links: Mutex::new(VecDeque::new()),
            hard_link_count,
            retain_on_read: false,
        })
    }
}

impl Cache for WeakCache {
    fn id(&self) -> &str {
        &self.0.id
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.0.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.0.get(key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.0.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.0.clear()
    }

    fn size(&self) -> usize {
        self.0.size()
    }
}

/// Soft store: hot entries are protected by re-retaining on read hits, and
/// the default retention is larger than the weak store's.
pub struct SoftCache(ReferenceStore);

impl SoftCache {
    pub fn new(id: &str) -> SoftCache {
        SoftCache::with_hard_links(id, DEFAULT_SOFT_HARD_LINKS)
    }

    pub fn with_hard_links(id: &str, hard_link_count: usize) -> SoftCache {
        SoftCache(ReferenceStore {
            id: id.to_string(),
            entries: Mutex::new(HashMap::new()),
            hard_links: Mutex::new(VecDeque::new()),
            hard_link_count,
            retain_on_read: true,
        })
    }
}

impl Cache for SoftCache {
    fn id(&self) -> &str {
        &self.0.id
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.0.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.0.get(key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.0.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.0.clear()
    }

    fn size(&self) -> usize {
        self.0.size()
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use serde_json::json;

    fn key(n: i64) -> CacheKey {
        let mut k = CacheKey::new();
        k.update(json!(n));
        k
    }

    #[test]
    fn perpetual_put_get_remove() {
        let cache = PerpetualCache::new("ns");
        cache.put(key(1), Arc::new(json!("a"))).unwrap();
        assert_eq!(cache.get(&key(1)).unwrap().unwrap().as_ref(), &json!("a"));
        assert_eq!(cache.size(), 1);
        cache.remove(&key(1)).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn weak_entries_survive_while_hard_queue_holds_them() {
        let cache = WeakCache::with_hard_links("ns", 1);
        cache.put(key(1), Arc::new(json!("a"))).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_some());
        // second put pushes the first entry off the 1-slot hard queue
        cache.put(key(2), Arc::new(json!("b"))).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_none());
        assert!(cache.get(&key(2)).unwrap().is_some());
    }

    #[test]
    fn weak_entries_survive_external_references() {
        let cache = WeakCache::with_hard_links("ns", 1);
        let held = Arc::new(json!("held"));
        cache.put(key(1), held.clone()).unwrap();
        cache.put(key(2), Arc::new(json!("b"))).unwrap();
        // key(1) left the hard queue but the caller still holds the Arc
        assert!(cache.get(&key(1)).unwrap().is_some());
    }

    #[test]
    fn soft_read_hits_protect_entries() {
        let cache = SoftCache::with_hard_links("ns", 2);
        cache.put(key(1), Arc::new(json!("a"))).unwrap();
        cache.put(key(2), Arc::new(json!("b"))).unwrap();
        // reading key(1) re-retains it, so the next put evicts key(2)'s slot
        // from the queue before key(1)'s
        let _ = cache.get(&key(1)).unwrap();
        cache.put(key(3), Arc::new(json!("c"))).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_some());
    }
}
