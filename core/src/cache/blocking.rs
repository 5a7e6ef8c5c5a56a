use crate::cache::{Cache, CacheKey};
use crate::{Error, Result};
use driver::Value;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct KeyLock {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl KeyLock {
    fn new() -> KeyLock {
        KeyLock {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

/// Collapses concurrent cache misses for one key into a single database
/// load: a miss on `get` leaves the caller holding the key's lock until its
/// following `put` (or an explicit `remove`) releases it, so other sessions
/// asking for the same key wait instead of re-querying.
pub struct BlockingCache {
    delegate: Box<dyn Cache>,
    timeout: Option<Duration>,
    locks: Mutex<HashMap<CacheKey, Arc<KeyLock>>>,
}

impl BlockingCache {
    pub fn new(delegate: Box<dyn Cache>, timeout: Option<Duration>) -> BlockingCache {
        BlockingCache {
            delegate,
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<KeyLock> {
        self.locks
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyLock::new()))
            .clone()
    }

    fn acquire(&self, key: &CacheKey) -> Result<()> {
        let entry = self.lock_for(key);
        let mut locked = entry.locked.lock().unwrap();
        match self.timeout {
            None => {
                while *locked {
                    locked = entry.cond.wait(locked).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *locked {
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .ok_or_else(|| Error::CacheLockTimeout(key.to_string()))?;
                    let (guard, wait) = entry.cond.wait_timeout(locked, remaining).unwrap();
                    locked = guard;
                    if wait.timed_out() && *locked {
                        return Err(Error::CacheLockTimeout(key.to_string()));
                    }
                }
            }
        }
        *locked = true;
        Ok(())
    }

    fn release(&self, key: &CacheKey) {
        let entry = self.locks.lock().unwrap().get(key).cloned();
        if let Some(entry) = entry {
            let mut locked = entry.locked.lock().unwrap();
            *locked = false;
            entry.cond.notify_all();
        }
    }
}

impl Cache for BlockingCache {
    fn id(&self) -> &str {
        self.delegate.id()
    }

    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()> {
        let result = self.delegate.put(key.clone(), value);
        self.release(&key);
        result
    }

    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.acquire(key)?;
        let found = self.delegate.get(key)?;
        if found.is_some() {
            self.release(key);
        }
        Ok(found)
    }

    // Releases the key's lock; entries themselves are only displaced by
    // clear. A session that missed and then fails uses this to unblock
    // waiters.
    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>> {
        self.release(key);
        Ok(None)
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
    use std::sync::mpsc;
    use std::thread;

    fn key(n: i64) -> CacheKey {
        let mut k = CacheKey::new();
        k.update(json!(n));
        k
    }

    #[test]
    fn missing_get_blocks_until_put() {
        let cache = Arc::new(BlockingCache::new(
            Box::new(PerpetualCache::new("ns")),
            None,
        ));
        // miss: this caller now holds the lock for key 1
        assert!(cache.get(&key(1)).unwrap().is_none());

        let (tx, rx) = mpsc::channel();
        let shared = cache.clone();
        let waiter = thread::spawn(move || {
            tx.send(()).unwrap();
            shared.get(&key(1)).unwrap()
        });
        rx.recv().unwrap();
        thread::sleep(Duration::from_millis(30));
        cache.put(key(1), Arc::new(json!("loaded"))).unwrap();
        let seen = waiter.join().unwrap();
        assert_eq!(seen.unwrap().as_ref(), &json!("loaded"));
    }

    #[test]
    fn lock_times_out() {
        let cache = Arc::new(BlockingCache::new(
            Box::new(PerpetualCache::new("ns")),
            Some(Duration::from_millis(30)),
        ));
        assert!(cache.get(&key(1)).unwrap().is_none());
        let shared = cache.clone();
        let waiter = thread::spawn(move || shared.get(&key(1)));
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::CacheLockTimeout(_)));
    }

    #[test]
    fn remove_releases_the_lock() {
        let cache = Arc::new(BlockingCache::new(
            Box::new(PerpetualCache::new("ns")),
            Some(Duration::from_millis(200)),
        ));
        assert!(cache.get(&key(1)).unwrap().is_none());
        cache.remove(&key(1)).unwrap();
        // lock is free again: a second miss acquires immediately
        assert!(cache.get(&key(1)).unwrap().is_none());
    }

    #[test]
    fn hit_does_not_hold_the_lock() {
        let cache = BlockingCache::new(Box::new(PerpetualCache::new("ns")), None);
        assert!(cache.get(&key(1)).unwrap().is_none());
        cache.put(key(1), Arc::new(json!("v"))).unwrap();
        assert!(cache.get(&key(1)).unwrap().is_some());
        assert!(cache.get(&key(1)).unwrap().is_some());
    }
}
