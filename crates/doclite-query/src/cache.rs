//! Bounded LRU cache of translated SQL templates.
//!
//! Keys are filter-shape fingerprints (operators, fields, structure — never
//! values), so two filters that differ only in literals share a template.
//! Insertion races are benign: last write wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Cached SQL templates keyed by filter shape.
pub struct TemplateCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    tick: u64,
}

struct Entry {
    sql: Arc<str>,
    last_used: u64,
}

impl TemplateCache {
    /// Default number of templates retained.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Creates a cache holding at most `capacity` templates. A capacity of
    /// zero disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a template, refreshing its recency on hit.
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.sql))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a template, evicting the least recently used entry when full.
    pub fn insert(&self, key: String, sql: Arc<str>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.map.contains_key(&key) && inner.map.len() >= self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
            }
        }
        inner.map.insert(
            key,
            Entry {
                sql,
                last_used: tick,
            },
        );
    }

    /// Number of cached templates.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// Returns `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total lookup hits.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total lookup misses.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned cache holds only strings; recover the inner state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_insert_hits() {
        let cache = TemplateCache::new(4);
        assert!(cache.get("k1").is_none());
        cache.insert("k1".into(), Arc::from("SELECT 1"));
        assert_eq!(cache.get("k1").as_deref(), Some("SELECT 1"));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = TemplateCache::new(2);
        cache.insert("a".into(), Arc::from("A"));
        cache.insert("b".into(), Arc::from("B"));
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), Arc::from("C"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn reinsert_updates_in_place() {
        let cache = TemplateCache::new(1);
        cache.insert("a".into(), Arc::from("old"));
        cache.insert("a".into(), Arc::from("new"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").as_deref(), Some("new"));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = TemplateCache::new(0);
        cache.insert("a".into(), Arc::from("A"));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }
}
