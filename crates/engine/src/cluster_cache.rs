//! Process-wide cache of cluster payloads, shared across every open
//! volume. Keyed either by content hash (`ContentBased` mode, so two
//! volumes sharing a clone parent hit the same entry) or by
//! `(namespace, ClusterLocation)` (`LocationBased` mode, invalidated on
//! every write since the payload at a location can change). Capacity is
//! a single global entry count; a volume's [`ClusterCacheConfig`] only
//! decides whether it reads/writes through this cache at all.

use dashmap::DashMap;
use novastore_core::types::{ClusterHash, ClusterLocation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Content([u8; 32]),
    Location { namespace: String, location: ClusterLocation },
}

pub struct ClusterCache {
    capacity: usize,
    entries: DashMap<CacheKey, Arc<Vec<u8>>>,
    lru: Mutex<VecDeque<CacheKey>>,
}

impl ClusterCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        let hit = self.entries.get(key).map(|e| e.clone());
        if hit.is_some() {
            self.touch(key);
        }
        hit
    }

    pub fn insert(&self, key: CacheKey, payload: Arc<Vec<u8>>) {
        if !self.entries.contains_key(&key) {
            self.evict_if_needed();
        }
        self.entries.insert(key.clone(), payload);
        self.touch(&key);
    }

    /// Drops a location-keyed entry; called on every write in
    /// `LocationBased` mode since the payload may no longer match.
    pub fn invalidate_location(&self, namespace: &str, location: ClusterLocation) {
        let key = CacheKey::Location {
            namespace: namespace.to_string(),
            location,
        };
        self.entries.remove(&key);
    }

    fn touch(&self, key: &CacheKey) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
        lru.push_back(key.clone());
    }

    fn evict_if_needed(&self) {
        if self.entries.len() < self.capacity {
            return;
        }
        let mut lru = self.lru.lock();
        if let Some(victim) = lru.pop_front() {
            self.entries.remove(&victim);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds the lookup key for a cluster given the volume's cache mode and
/// whatever hash the write path computed (`None` in `LocationBased`).
pub fn key_for(namespace: &str, location: ClusterLocation, hash: ClusterHash) -> Option<CacheKey> {
    match hash {
        Some(h) => Some(CacheKey::Content(h)),
        None => Some(CacheKey::Location {
            namespace: namespace.to_string(),
            location,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_drops_the_least_recently_used_entry() {
        let cache = ClusterCache::new(2);
        cache.insert(CacheKey::Content([1; 32]), Arc::new(vec![1]));
        cache.insert(CacheKey::Content([2; 32]), Arc::new(vec![2]));
        cache.get(&CacheKey::Content([1; 32]));
        cache.insert(CacheKey::Content([3; 32]), Arc::new(vec![3]));

        assert!(cache.get(&CacheKey::Content([1; 32])).is_some());
        assert!(cache.get(&CacheKey::Content([2; 32])).is_none());
        assert!(cache.get(&CacheKey::Content([3; 32])).is_some());
    }

    #[test]
    fn location_invalidation_removes_the_entry() {
        let cache = ClusterCache::new(4);
        let loc = ClusterLocation::new(novastore_core::types::Sco::own(1), 0);
        let key = CacheKey::Location {
            namespace: "ns".to_string(),
            location: loc,
        };
        cache.insert(key.clone(), Arc::new(vec![9]));
        cache.invalidate_location("ns", loc);
        assert!(cache.get(&key).is_none());
    }
}
