//! Bounded caches with clock eviction.
//!
//! [`ClockCache`] backs both the record cache (primary key to decoded
//! columns) and the index page caches (page id to page). Eviction uses the
//! clock algorithm, a second-chance approximation of LRU. Entries that report
//! themselves as pinned (dirty pages) are never evicted; the cache grows past
//! its capacity instead until they are flushed.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{columns::Columns, page::Page};

/// Values that can be held in a [`ClockCache`].
pub trait Cacheable: Clone {
    /// Pinned values are never evicted.
    fn is_pinned(&self) -> bool {
        false
    }
}

impl Cacheable for Page {
    fn is_pinned(&self) -> bool {
        self.dirty
    }
}

impl Cacheable for Columns {}

struct Entry<V> {
    value: V,
    /// Accessed since the last sweep (second chance).
    accessed: bool,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    order: Vec<K>,
    hand: usize,
}

/// Bounded cache with clock eviction. A capacity of 0 disables it.
pub struct ClockCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Cacheable> ClockCache<K, V> {
    /// Creates a cache holding at most `capacity` unpinned entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(4096)),
                order: Vec::with_capacity(capacity.min(4096)),
                hand: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns true if the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Returns a clone of the cached value.
    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.accessed = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Inserts or replaces a value, evicting an unpinned entry when full.
    pub fn insert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.accessed = true;
            return;
        }
        if inner.entries.len() >= self.capacity {
            // When everything is pinned the cache grows past capacity.
            Self::evict_one(&mut inner);
        }
        inner.order.push(key.clone());
        inner.entries.insert(key, Entry { value, accessed: true });
    }

    /// Removes a value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(key)?;
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
            if inner.hand > pos {
                inner.hand -= 1;
            }
        }
        Some(entry.value)
    }

    /// Applies `f` to the cached value in place, if present.
    pub fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                f(&mut entry.value);
                true
            },
            None => false,
        }
    }

    fn evict_one(inner: &mut Inner<K, V>) -> bool {
        if inner.order.is_empty() {
            return true;
        }
        // Two sweeps: the first may only clear accessed bits.
        let max_steps = inner.order.len() * 2;
        for _ in 0..max_steps {
            if inner.hand >= inner.order.len() {
                inner.hand = 0;
            }
            let hand = inner.hand;
            let key = inner.order[hand].clone();
            let evict = match inner.entries.get_mut(&key) {
                Some(entry) if entry.value.is_pinned() => false,
                Some(entry) if entry.accessed => {
                    entry.accessed = false;
                    false
                },
                _ => true,
            };
            if evict {
                inner.entries.remove(&key);
                inner.order.remove(hand);
                return true;
            }
            inner.hand += 1;
        }
        false
    }

    /// Returns clones of every value matching `pred`.
    pub fn collect_where<F: Fn(&V) -> bool>(&self, pred: F) -> Vec<V> {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| pred(&entry.value))
            .map(|entry| entry.value.clone())
            .collect()
    }

    /// Drops every entry matching `pred`.
    pub fn retain<F: Fn(&V) -> bool>(&self, pred: F) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|_, entry| pred(&entry.value));
        let Inner { entries, order, hand } = &mut *inner;
        order.retain(|key| entries.contains_key(key));
        *hand = 0;
    }

    /// Clears all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.hand = 0;
    }

    /// Returns the number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Checks if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if a key is cached.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            pinned: inner.entries.values().filter(|e| e.value.is_pinned()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current number of cached entries.
    pub size: usize,
    /// Maximum capacity.
    pub capacity: usize,
    /// Number of pinned (dirty) entries.
    pub pinned: usize,
    /// Total cache hits since creation.
    pub hits: u64,
    /// Total cache misses since creation.
    pub misses: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::{error::PageType, page::Page};

    fn dirty_page(id: u64) -> Page {
        Page::new(id, 512, PageType::BTreeLeaf, 1)
    }

    fn clean_page(id: u64) -> Page {
        Page::from_bytes(id, vec![0u8; 512])
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache: ClockCache<Vec<u8>, Columns> = ClockCache::new(0);
        assert!(!cache.is_enabled());
        cache.insert(b"k".to_vec(), Columns::new());
        assert!(cache.get(&b"k".to_vec()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_eviction_of_clean_entries() {
        let cache = ClockCache::new(3);
        for id in 0..4 {
            cache.insert(id, clean_page(id));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_no_eviction_of_dirty_pages() {
        let cache = ClockCache::new(3);
        for id in 0..4 {
            cache.insert(id, dirty_page(id));
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().pinned, 4);
        for id in 0..4 {
            assert!(cache.contains(&id));
        }
    }

    #[test]
    fn test_second_chance_keeps_recently_used() {
        let cache = ClockCache::new(3);
        cache.insert(0u64, clean_page(0));
        cache.insert(1, clean_page(1));
        cache.insert(2, clean_page(2));
        // First sweep clears every accessed bit and evicts page 0; touching
        // page 1 afterwards protects it on the next eviction.
        cache.insert(3, clean_page(3));
        assert!(!cache.contains(&0));
        cache.get(&1);
        cache.insert(4, clean_page(4));
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = ClockCache::new(4);
        cache.insert(1u64, clean_page(1));
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_retain_and_update() {
        let cache = ClockCache::new(8);
        cache.insert(1u64, dirty_page(1));
        cache.insert(2, clean_page(2));
        assert!(cache.update(&1, |page| page.dirty = false));
        cache.retain(|page| page.id != 2);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.collect_where(|page| page.dirty).is_empty());
    }

    #[test]
    fn stress_concurrent_access_with_eviction() {
        let cache = Arc::new(ClockCache::new(50));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200u64 {
                        let id = t * 1000 + i;
                        cache.insert(id, clean_page(id));
                        if let Some(page) = cache.get(&id) {
                            assert_eq!(page.id, id);
                        }
                        if i % 7 == 0 {
                            cache.remove(&(id - i / 2));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.len() <= 50);
    }
}
