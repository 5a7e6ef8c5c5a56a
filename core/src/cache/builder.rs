use crate::cache::{
    BlockingCache, Cache, FifoCache, LoggingCache, LruCache, PerpetualCache, ScheduledCache,
    SerializedCache, SoftCache, SynchronizedCache, WeakCache,
};
use crate::{Error, Result};
use constants::DEFAULT_CACHE_SIZE;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eviction {
    Lru,
    Fifo,
    Weak,
    Soft,
}

impl Eviction {
    pub fn from_name(name: &str) -> Option<Eviction> {
        Some(match name.to_uppercase().as_str() {
            "LRU" => Eviction::Lru,
            "FIFO" => Eviction::Fifo,
            "WEAK" => Eviction::Weak,
            "SOFT" => Eviction::Soft,
            _ => return None,
        })
    }
}

/// Assembles a namespace cache in the fixed layer order:
/// store, eviction, blocking, serialization, logging, synchronization and
/// finally the scheduled clear.
pub struct CacheBuilder {
    id: String,
    eviction: Eviction,
    size: Option<usize>,
    clear_interval: Option<Duration>,
    read_write: bool,
    blocking: bool,
    blocking_timeout: Option<Duration>,
}

impl CacheBuilder {
    pub fn new(id: &str) -> CacheBuilder {
        CacheBuilder {
            id: id.to_string(),
            eviction: Eviction::Lru,
            size: None,
            clear_interval: None,
            read_write: false,
            blocking: false,
            blocking_timeout: None,
        }
    }

    pub fn eviction(mut self, eviction: Eviction) -> CacheBuilder {
        self.eviction = eviction;
        self
    }

    pub fn eviction_name(mut self, name: &str) -> Result<CacheBuilder> {
        self.eviction = Eviction::from_name(name)
            .ok_or_else(|| Error::malformed(format!("unknown cache eviction policy: {name}")))?;
        Ok(self)
    }

    pub fn size(mut self, size: usize) -> CacheBuilder {
        self.size = Some(size);
        self
    }

    pub fn clear_interval(mut self, interval: Duration) -> CacheBuilder {
        self.clear_interval = Some(interval);
        self
    }

    /// Serialize entries so readers get isolated copies.
    pub fn read_write(mut self, read_write: bool) -> CacheBuilder {
        self.read_write = read_write;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> CacheBuilder {
        self.blocking = blocking;
        self
    }

    pub fn blocking_timeout(mut self, timeout: Option<Duration>) -> CacheBuilder {
        self.blocking_timeout = timeout;
        self
    }

    pub fn build(self) -> Arc<dyn Cache> {
        let size = self.size.unwrap_or(DEFAULT_CACHE_SIZE);
        // weak and soft stores carry their own eviction; the bounded
        // policies wrap the plain store
        let mut cache: Box<dyn Cache> = match self.eviction {
            Eviction::Lru => Box::new(LruCache::new(
                Box::new(PerpetualCache::new(&self.id)),
                size,
            )),
            Eviction::Fifo => Box::new(FifoCache::new(
                Box::new(PerpetualCache::new(&self.id)),
                size,
            )),
            Eviction::Weak => Box::new(WeakCache::new(&self.id)),
            Eviction::Soft => Box::new(SoftCache::new(&self.id)),
        };
        if self.blocking {
            cache = Box::new(BlockingCache::new(cache, self.blocking_timeout));
        }
        if self.read_write {
            cache = Box::new(SerializedCache::new(cache));
        }
        cache = Box::new(LoggingCache::new(cache));
        cache = Box::new(SynchronizedCache::new(cache));
        if let Some(interval) = self.clear_interval {
            cache = Box::new(ScheduledCache::new(cache, interval));
        }
        Arc::from(cache)
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use crate::cache::CacheKey;
    use driver::Value;
    use serde_json::json;

    #[test]
    fn default_build_round_trips() {
        let cache = CacheBuilder::new("ns").build();
        assert_eq!(cache.id(), "ns");
        let mut key = CacheKey::new();
        key.update(json!(1));
        cache.put(key.clone(), Arc::new(json!(["row"]))).unwrap();
        assert_eq!(cache.get(&key).unwrap().unwrap().as_ref(), &json!(["row"]));
    }

    #[test]
    fn read_write_build_returns_copies() {
        let cache = CacheBuilder::new("ns").read_write(true).build();
        let mut key = CacheKey::new();
        key.update(json!(1));
        let stored = Arc::new(json!({"id": 7}));
        cache.put(key.clone(), stored.clone()).unwrap();
        let restored = cache.get(&key).unwrap().unwrap();
        assert_eq!(restored.as_ref(), stored.as_ref());
        assert!(!Arc::ptr_eq(&restored, &stored));
    }

    #[test]
    fn eviction_names_parse() {
        assert_eq!(Eviction::from_name("fifo"), Some(Eviction::Fifo));
        assert_eq!(Eviction::from_name("SOFT"), Some(Eviction::Soft));
        assert!(Eviction::from_name("ring").is_none());
    }

    #[test]
    fn clear_interval_empties_after_elapse() {
        let cache = CacheBuilder::new("ns")
            .clear_interval(Duration::from_millis(20))
            .build();
        let mut key = CacheKey::new();
        key.update(json!(1));
        cache.put(key.clone(), Arc::new(Value::Null)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key).unwrap().is_none());
    }
}
