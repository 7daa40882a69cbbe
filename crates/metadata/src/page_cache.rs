//! Page-granularity LRU cache in front of the metadata-server backend.
//! A page groups a fixed run of cluster addresses so a single RPC can
//! touch many clusters at once; dirty pages are flushed on `sync()` or
//! `uncork()`, clean pages are evicted for free.

use novastore_core::types::{ClusterAddress, ClusterLocationAndHash};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

pub const PAGE_ENTRIES: u64 = 512;

pub type PageId = u64;

pub fn page_of(ca: ClusterAddress) -> PageId {
    ca / PAGE_ENTRIES
}

#[derive(Clone)]
pub struct Page {
    pub entries: Vec<ClusterLocationAndHash>,
    pub dirty: bool,
}

impl Page {
    fn unwritten() -> Self {
        Self {
            entries: vec![ClusterLocationAndHash::unwritten(); PAGE_ENTRIES as usize],
            dirty: false,
        }
    }

    pub fn get(&self, ca: ClusterAddress) -> ClusterLocationAndHash {
        self.entries[(ca % PAGE_ENTRIES) as usize]
    }

    pub fn set(&mut self, ca: ClusterAddress, value: ClusterLocationAndHash) {
        self.entries[(ca % PAGE_ENTRIES) as usize] = value;
        self.dirty = true;
    }
}

/// LRU-evicting page table. Capacity is in pages, not bytes; callers
/// size it from `MetadataBackendConfig::cache_capacity_pages`.
pub struct PageCache {
    capacity: usize,
    pages: FxHashMap<PageId, Page>,
    lru: VecDeque<PageId>,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pages: FxHashMap::default(),
            lru: VecDeque::new(),
        }
    }

    fn touch(&mut self, id: PageId) {
        if let Some(pos) = self.lru.iter().position(|p| *p == id) {
            self.lru.remove(pos);
        }
        self.lru.push_back(id);
    }

    /// Returns the cached page if present, loading via `loader` on miss.
    /// `loader` returns `None` for a page that was never written.
    pub fn get_or_load(
        &mut self,
        id: PageId,
        loader: impl FnOnce() -> novastore_core::error::Result<Option<Page>>,
    ) -> novastore_core::error::Result<&mut Page> {
        if !self.pages.contains_key(&id) {
            let page = loader()?.unwrap_or_else(Page::unwritten);
            self.evict_if_needed();
            self.pages.insert(id, page);
        }
        self.touch(id);
        Ok(self.pages.get_mut(&id).expect("just inserted"))
    }

    fn evict_if_needed(&mut self) {
        while self.pages.len() >= self.capacity {
            let Some(victim) = self.lru.iter().position(|id| {
                self.pages.get(id).map(|p| !p.dirty).unwrap_or(true)
            }) else {
                // Every resident page is dirty; nothing left to evict for
                // free. Callers should sync before hitting this.
                break;
            };
            let id = self.lru.remove(victim).unwrap();
            self.pages.remove(&id);
        }
    }

    pub fn dirty_pages(&self) -> impl Iterator<Item = (&PageId, &Page)> {
        self.pages.iter().filter(|(_, p)| p.dirty)
    }

    pub fn mark_clean(&mut self, id: PageId) {
        if let Some(p) = self.pages.get_mut(&id) {
            p.dirty = false;
        }
    }

    pub fn drop_clean(&mut self, id: PageId) {
        if let Some(p) = self.pages.get(&id) {
            if !p.dirty {
                self.pages.remove(&id);
                if let Some(pos) = self.lru.iter().position(|p| *p == id) {
                    self.lru.remove(pos);
                }
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.pages.clear();
        self.lru.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_pages_are_evicted_before_dirty_ones() {
        let mut cache = PageCache::new(2);
        cache.get_or_load(0, || Ok(None)).unwrap();
        cache.get_or_load(1, || Ok(None)).unwrap().set(1 * PAGE_ENTRIES, ClusterLocationAndHash::unwritten());
        // page 0 stays clean; page 1 is now dirty. Loading page 2 should
        // evict page 0, not page 1.
        cache.get_or_load(2, || Ok(None)).unwrap();
        assert!(cache.pages.contains_key(&1));
        assert!(!cache.pages.contains_key(&0));
    }
}
