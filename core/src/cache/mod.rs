//! Composable cache layers over a plain store, plus the cache key that
//! identifies one query invocation.

mod store;
pub use store::{PerpetualCache, SoftCache, WeakCache};
mod decorators;
pub use decorators::{
    FifoCache, LoggingCache, LruCache, ScheduledCache, SerializedCache, SynchronizedCache,
};
mod blocking;
pub use blocking::BlockingCache;
mod builder;
pub use builder::{CacheBuilder, Eviction};
pub mod tx;

use crate::Result;
use driver::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// One cache layer. Layers compose by decoration; the innermost layer is a
/// plain hash-map store. All layers are shared across sessions and must be
/// internally synchronized.
pub trait Cache: Send + Sync {
    fn id(&self) -> &str;
    fn put(&self, key: CacheKey, value: Arc<Value>) -> Result<()>;
    fn get(&self, key: &CacheKey) -> Result<Option<Arc<Value>>>;
    fn remove(&self, key: &CacheKey) -> Result<Option<Arc<Value>>>;
    fn clear(&self) -> Result<()>;
    fn size(&self) -> usize;
}

const HASH_MULTIPLIER: u64 = 37;
const HASH_SEED: u64 = 17;

/// Deterministic identity of a query invocation: statement id, row range,
/// final SQL and every bound parameter value, in order.
///
/// `checksum` and `count` short-circuit equality before the component walk.
#[derive(Clone, Debug)]
pub struct CacheKey {
    hashcode: u64,
    checksum: u64,
    count: usize,
    parts: Vec<Value>,
}

impl Default for CacheKey {
    fn default() -> CacheKey {
        CacheKey::new()
    }
}

impl CacheKey {
    pub fn new() -> CacheKey {
        CacheKey {
            hashcode: HASH_SEED,
            checksum: 0,
            count: 0,
            parts: Vec::new(),
        }
    }

    pub fn update(&mut self, part: Value) {
        let h = value_hash(&part);
        self.count += 1;
        self.checksum = self.checksum.wrapping_add(h);
        self.hashcode = self
            .hashcode
            .wrapping_mul(HASH_MULTIPLIER)
            .wrapping_add(h.wrapping_mul(self.count as u64));
        self.parts.push(part);
    }

    pub fn update_all(&mut self, parts: impl IntoIterator<Item = Value>) {
        for part in parts {
            self.update(part);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &CacheKey) -> bool {
        if self.hashcode != other.hashcode
            || self.checksum != other.checksum
            || self.count != other.count
        {
            return false;
        }
        self.parts == other.parts
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hashcode);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hashcode, self.checksum)?;
        for part in &self.parts {
            write!(f, ":{part}")?;
        }
        Ok(())
    }
}

// A stable per-value hash; structural, so logically equal values always
// collide onto the same bucket.
fn value_hash(value: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hash_value_into(value, &mut hasher);
    hasher.finish()
}

fn hash_value_into(value: &Value, hasher: &mut impl Hasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            if let Some(i) = n.as_i64() {
                i.hash(hasher);
            } else if let Some(f) = n.as_f64() {
                f.to_bits().hash(hasher);
            }
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value_into(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            map.len().hash(hasher);
            for (k, v) in map {
                k.hash(hasher);
                hash_value_into(v, hasher);
            }
        }
    }
}

#[cfg(test)]
mod unit {
    use super::*;
    use serde_json::json;

    fn key_of(parts: &[Value]) -> CacheKey {
        let mut key = CacheKey::new();
        key.update_all(parts.iter().cloned());
        key
    }

    #[test]
    fn equal_component_sequences_are_equal() {
        let a = key_of(&[json!("u.findById"), json!(0), json!(1000), json!(7)]);
        let b = key_of(&[json!("u.findById"), json!(0), json!(1000), json!(7)]);
        assert_eq!(a, b);
        let mut ha = std::collections::hash_map::DefaultHasher::new();
        let mut hb = std::collections::hash_map::DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn order_matters() {
        let a = key_of(&[json!(1), json!(2)]);
        let b = key_of(&[json!(2), json!(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn differing_counts_differ() {
        let a = key_of(&[json!(1)]);
        let b = key_of(&[json!(1), json!(1)]);
        assert_ne!(a, b);
    }

    #[test]
    fn null_and_zero_differ() {
        let a = key_of(&[json!(null)]);
        let b = key_of(&[json!(0)]);
        assert_ne!(a, b);
    }
}
