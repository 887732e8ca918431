//! Bounded TTL cache used by the IP/DNS layers.

use dashmap::DashMap;
use std::hash::Hash;

use crate::mytime::MyTime;

/// A concurrent cache with per-entry expiry and a size bound.
///
/// Reads are checked against the entry age lazily; when the map outgrows
/// its bound on insert, expired entries are dropped and, if that is not
/// enough, the whole map is cleared. Entry count stays small (thousands),
/// so the blunt strategy beats tracking access order.
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash, V: Clone> {
    entries: DashMap<K, (f64, V)>,
    max_count: usize,
    max_age: f64,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// Create a cache bounded by entry count and age (seconds).
    pub fn new(max_count: usize, max_age: f64) -> Self {
        Self {
            entries: DashMap::new(),
            max_count,
            max_age,
        }
    }

    /// Fetch a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        let (stored_at, value) = entry.value();
        if MyTime::time() - stored_at > self.max_age {
            return None;
        }
        Some(value.clone())
    }

    /// Store an entry, evicting as needed.
    pub fn set(&self, key: K, value: V) {
        if self.entries.len() >= self.max_count {
            let now = MyTime::time();
            self.entries
                .retain(|_, (stored_at, _)| now - *stored_at <= self.max_age);
            if self.entries.len() >= self.max_count {
                self.entries.clear();
            }
        }
        self.entries.insert(key, (MyTime::time(), value));
    }

    /// Drop one entry.
    pub fn unset(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Number of stored entries (live or not).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mytime::AlternateNowGuard;

    #[test]
    fn test_entries_expire() {
        let _guard = AlternateNowGuard::set(1_000.0);
        let cache: TtlCache<&str, i32> = TtlCache::new(10, 300.0);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        crate::mytime::MyTime::set_alternate_now(1_301.0);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_size_bound() {
        let _guard = AlternateNowGuard::set(1_000.0);
        let cache: TtlCache<i32, i32> = TtlCache::new(4, 300.0);
        for i in 0..8 {
            cache.set(i, i);
        }
        assert!(cache.len() <= 4);
    }
}
