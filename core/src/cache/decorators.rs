use crate::cache::{Cache, CacheKey};
use crate::{Error, Result};
use driver::Value;
use log::debug;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Bounds the delegate with access-order eviction: on overflow the least
/// recently used key is evicted from the delegate.
pub struct LruCache {
    delegate: Box<dyn Cache>,
    capacity: usize,
    // access order, least recently used first
    keys: Mutex<VecDeque<CacheKey>>,
}

impl LruCache {
    pub fn new(delegate: Box<dyn Cache>, capacity: usize) -> LruCache {
        LruCache {
            delegate,
            capacity: capacity.max(1),
            keys: Mutex::new(VecDeque::new()),
        }
    }

    fn touch(&self, key: &CacheKey) {
        let mut keys = self.keys.lock().unwrap();
        if let Some(pos) = keys.iter().position(|k| k == key) {
            let k = keys.remove(pos).unwrap();
            keys.push_back(k);
        }
    }
}

impl Cache for LruCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.delegate.put(key.clone(), value)?;
        let eldest = {
            let mut keys = self.keys.lock().unwrap();
            if let Some(pos) = keys.iter().position(|k| *k == key) {
                keys.remove(pos);
            }
            keys.push_back(key);
            if keys.len() > self.capacity {
                keys.pop_front()
            } else {
                None
            }
        };
        if let Some(eldest) = eldest {
            self.delegate.remove(&eldest)?;
        }
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        let found = self.delegate.get(key)?;
        if found.is_some() {
            self.touch(key);
        }
        Ok(found)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.keys.lock().unwrap().retain(|k| k != key);
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.keys.lock().unwrap().clear();
        self.delegate.clear()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }
}

/// Bounds the delegate by insertion order.
pub struct FifoCache {
    delegate: Box<dyn Cache>,
    capacity: usize,
    keys: Mutex<VecDeque<CacheKey>>,
}

impl FifoCache {
    pub fn new(delegate: Box<dyn Cache>, capacity: usize) -> FifoCache {
        FifoCache {
            delegate,
            capacity: capacity.max(1),
            keys: Mutex::new(VecDeque::new()),
        }
    }
}

impl Cache for FifoCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.delegate.put(key.clone(), value)?;
        let eldest = {
            let mut keys = self.keys.lock().unwrap();
            if !keys.contains(&key) {
                keys.push_back(key);
            }
            if keys.len() > self.capacity {
                keys.pop_front()
            } else {
                None
            }
        };
        if let Some(eldest) = eldest {
            self.delegate.remove(&eldest)?;
        }
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.keys.lock().unwrap().retain(|k| k != key);
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.keys.lock().unwrap().clear();
        self.delegate.clear()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }
}

/// Clears the delegate whenever the configured interval has elapsed; the
/// check runs before every access.
pub struct ScheduledCache {
    delegate: Box<dyn Cache>,
    interval: Duration,
    last_clear: Mutex<Instant>,
}

impl ScheduledCache {
    pub fn new(delegate: Box<dyn Cache>, interval: Duration) -> ScheduledCache {
        ScheduledCache {
            delegate,
            interval,
            last_clear: Mutex::new(Instant::now()),
        }
    }

    fn clear_when_stale(&self) -> Result<bool> {
        let mut last_clear = self.last_clear.lock().unwrap();
        if last_clear.elapsed() > self.interval {
            *last_clear = Instant::now();
            self.delegate.clear()?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Cache for ScheduledCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.clear_when_stale()?;
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        if self.clear_when_stale()? {
            return Ok(None);
        }
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.clear_when_stale()?;
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        *self.last_clear.lock().unwrap() = Instant::now();
        self.delegate.clear()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }
}

/// Stores values in serialized form so cached results are isolated copies
/// (read-write semantics).
pub struct SerializedCache {
    delegate: Box<dyn Cache>,
}

impl SerializedCache {
    pub fn new(delegate: Box<dyn Cache>) -> SerializedCache {
        SerializedCache { delegate }
    }
}

impl Cache for SerializedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        let serialized =
            serde_json::to_string(value.as_ref()).map_err(|e| Error::CacheSerialization {
                cache: self.id().to_string(),
                reason: e.to_string(),
            })?;
        self.delegate.put(key, Arc::new(Value::String(serialized)))
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        match self.delegate.get(key)? {
            None => Ok(None),
            Some(stored) => match stored.as_ref() {
                Value::String(serialized) => {
                    let value: Value =
                        serde_json::from_str(serialized).map_err(|e| Error::CacheSerialization {
                            cache: self.id().to_string(),
                            reason: e.to_string(),
                        })?;
                    Ok(Some(Arc::new(value)))
                }
                _ => Err(Error::CacheSerialization {
                    cache: self.id().to_string(),
                    reason: "stored entry is not in serialized form".to_string(),
                }),
            },
        }
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.delegate.clear()
    }

    fn size(&self) -> usize {
        self.delegate.size()
    }
}

/// Coarse mutex around every operation. Outermost layer; what serializes
/// concurrent sessions touching one namespace cache.
pub struct SynchronizedCache {
    delegate: Box<dyn Cache>,
    lock: Mutex<()>,
}

impl SynchronizedCache {
    pub fn new(delegate: Box<dyn Cache>) -> SynchronizedCache {
        SynchronizedCache {
            delegate,
            lock: Mutex::new(()),
        }
    }
}

impl Cache for SynchronizedCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        let _guard = self.lock.lock().unwrap();
        self.delegate.get(key)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        let _guard = self.lock.lock().unwrap();
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap();
        self.delegate.clear()
    }

    fn size(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        self.delegate.size()
    }
}

/// Counts requests and hits and logs the running hit ratio.
pub struct LoggingCache {
    delegate: Box<dyn Cache>,
    requests: AtomicU64,
    hits: AtomicU64,
}

impl LoggingCache {
    pub fn new(delegate: Box<dyn Cache>) -> LoggingCache {
        LoggingCache {
            delegate,
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.hits.load(Ordering::Relaxed) as f64 / requests as f64
        }
    }
}

impl Cache for LoggingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        self.delegate.put(key, value)
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let found = self.delegate.get(key)?;
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            "cache hit ratio [{}]: {:.2}",
            self.id(),
            self.hit_ratio()
        );
        Ok(found)
    }

    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.delegate.remove(key)
    }

    fn clear(&self) -> Result<()> {
        self.delegate.clear()
    }

    fn size(&self) -> usize {
        self.delegate.size()
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

    fn value(s: &str) -> Arc<Value> {
        Arc::new(json!(s))
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = LruCache::new(Box::new(PerpetualCache::new("ns")), 3);
        for n in 1..=3 {
            cache.put(key(n), value("v")).unwrap();
        }
        // touch 1 so 2 becomes the eviction candidate
        let _ = cache.get(&key(1)).unwrap();
        cache.put(key(4), value("v")).unwrap();
        assert!(cache.get(&key(2)).unwrap().is_none());
        assert!(cache.get(&key(1)).unwrap().is_some());
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn fifo_evicts_insertion_order() {
        let cache = FifoCache::new(Box::new(PerpetualCache::new("ns")), 3);
        for n in 1..=3 {
            cache.put(key(n), value("v")).unwrap();
        }
        let _ = cache.get(&key(1)).unwrap();
        cache.put(key(4), value("v")).unwrap();
        // access order is irrelevant: the first inserted key goes
        assert!(cache.get(&key(1)).unwrap().is_none());
        assert!(cache.get(&key(2)).unwrap().is_some());
    }

    #[test]
    fn exactly_one_eviction_on_overflow() {
        let cache = LruCache::new(Box::new(PerpetualCache::new("ns")), 5);
        for n in 1..=6 {
            cache.put(key(n), value("v")).unwrap();
        }
        let alive = (1..=6)
            .filter(|n| cache.get(&key(*n)).unwrap().is_some())
            .count();
        assert_eq!(alive, 5);
    }

    #[test]
    fn scheduled_clears_after_interval() {
        let cache = ScheduledCache::new(
            Box::new(PerpetualCache::new("ns")),
            Duration::from_millis(20),
        );
        cache.put(key(1), value("v")).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key(1)).unwrap().is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn serialized_round_trips_and_isolates() {
        let cache = SerializedCache::new(Box::new(PerpetualCache::new("ns")));
        let original = Arc::new(json!([{"id": 7, "name": "Ann"}]));
        cache.put(key(1), original.clone()).unwrap();
        let restored = cache.get(&key(1)).unwrap().unwrap();
        assert_eq!(restored.as_ref(), original.as_ref());
        // distinct allocation, not the same Arc
        assert!(!Arc::ptr_eq(&restored, &original));
    }

    #[test]
    fn logging_counts_hits() {
        let cache = LoggingCache::new(Box::new(PerpetualCache::new("ns")));
        cache.put(key(1), value("v")).unwrap();
        let _ = cache.get(&key(1)).unwrap();
        let _ = cache.get(&key(2)).unwrap();
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
