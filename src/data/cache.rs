use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Concurrent map whose entries expire after a fixed TTL.
pub struct TtlCache<K, V> {
    cache: DashMap<K, CachedValue<V>>,
    ttl: Duration,
}

struct CachedValue<V> {
    value: V,
    timestamp: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.cache.insert(key, CachedValue {
            value,
            timestamp: Instant::now(),
        });
    }

    /// Get value if not expired (evict on read)
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.cache.get(key) {
            Some(entry) if entry.timestamp.elapsed() <= self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.cache.remove(key);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cache_insert_and_get() {
        let cache = TtlCache::new(Duration::from_secs(300));
        cache.insert("2025-01-01".to_string(), 47.0);

        assert_eq!(cache.get(&"2025-01-01".to_string()), Some(47.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_ttl_expiration() {
        let cache = TtlCache::new(Duration::from_millis(100));
        cache.insert("PHL", 3.5);

        assert_eq!(cache.get(&"PHL"), Some(3.5));

        thread::sleep(Duration::from_millis(150));

        assert_eq!(cache.get(&"PHL"), None);
        assert!(cache.is_empty());
    }
}
