//! Local SCO landing/read cache.
//!
//! Cache entries live in an arena (`Vec<Slot>`) with a free list, and are
//! threaded through an intrusive doubly-linked LRU list addressed by
//! arena index: two indices and one ownership direction, rather than a
//! `CachedSCO <-> MountPoint` reference cycle. External callers hold a
//! [`CacheHandle`] (index + generation) so a stale handle from a
//! since-evicted slot is detected rather than silently aliasing a
//! reused slot.

use novastore_core::types::Sco;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::time::Instant;

pub type MountPointId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    index: u32,
    generation: u32,
}

struct Entry {
    sco: Sco,
    mountpoint: MountPointId,
    size_bytes: u64,
    disposable: bool,
    last_access: Instant,
    prev: Option<u32>,
    next: Option<u32>,
    generation: u32,
}

enum Slot {
    Vacant { next_free: Option<u32>, generation: u32 },
    Occupied(Entry),
}

pub struct MountPoint {
    pub id: MountPointId,
    pub path: PathBuf,
    pub capacity_bytes: u64,
    pub trigger_gap_bytes: u64,
    pub used_bytes: u64,
    pub offline: bool,
}

impl MountPoint {
    /// Bytes available before the cleaner's reserved gap is breached, per
    /// "reserved gap that keeps the cleaner from running
    /// synchronously on the write path".
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes
            .saturating_sub(self.used_bytes)
            .saturating_sub(self.trigger_gap_bytes)
    }
}

/// Process-wide-in-spirit, but instantiated per volume namespace: the
/// local SCO cache.
pub struct ScoCache {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    index: FxHashMap<Sco, u32>,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    mountpoints: Vec<MountPoint>,
    non_disposable_bytes: u64,
}

impl ScoCache {
    pub fn new(mountpoints: Vec<MountPoint>) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            index: FxHashMap::default(),
            lru_head: None,
            lru_tail: None,
            mountpoints,
            non_disposable_bytes: 0,
        }
    }

    pub fn non_disposable_bytes(&self) -> u64 {
        self.non_disposable_bytes
    }

    /// Picks the mountpoint with the most free space that can fit
    /// `size_bytes`. Returns `None` when every mountpoint is offline or
    /// out of space (caller surfaces `Error::ScoCacheFull`, ).
    pub fn pick_mountpoint(&self, size_bytes: u64) -> Option<MountPointId> {
        self.mountpoints
            .iter()
            .filter(|mp| !mp.offline && mp.free_bytes() >= size_bytes)
            .max_by_key(|mp| mp.free_bytes())
            .map(|mp| mp.id)
    }

    pub fn mountpoint_mut(&mut self, id: MountPointId) -> Option<&mut MountPoint> {
        self.mountpoints.iter_mut().find(|mp| mp.id == id)
    }

    /// Registers a freshly-created or re-enabled SCO in the cache.
    /// Newly-created SCOs start nondisposable.
    pub fn insert(&mut self, sco: Sco, mountpoint: MountPointId, size_bytes: u64) -> CacheHandle {
        if let Some(mp) = self.mountpoint_mut(mountpoint) {
            mp.used_bytes += size_bytes;
        }
        self.non_disposable_bytes += size_bytes;

        let index = match self.free_head {
            Some(i) => {
                let next_free = match &self.slots[i as usize] {
                    Slot::Vacant { next_free, .. } => *next_free,
                    Slot::Occupied(_) => unreachable!(),
                };
                self.free_head = next_free;
                i
            }
            None => {
                self.slots.push(Slot::Vacant {
                    next_free: None,
                    generation: 0,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let generation = match &self.slots[index as usize] {
            Slot::Vacant { generation, .. } => *generation,
            Slot::Occupied(_) => 0,
        };

        self.slots[index as usize] = Slot::Occupied(Entry {
            sco,
            mountpoint,
            size_bytes,
            disposable: false,
            last_access: Instant::now(),
            prev: None,
            next: None,
            generation,
        });
        self.index.insert(sco, index);
        self.push_front(index);

        CacheHandle { index, generation }
    }

    pub fn lookup(&self, sco: Sco) -> Option<CacheHandle> {
        let index = *self.index.get(&sco)?;
        let generation = match &self.slots[index as usize] {
            Slot::Occupied(e) => e.generation,
            Slot::Vacant { .. } => return None,
        };
        Some(CacheHandle { index, generation })
    }

    pub fn contains(&self, sco: Sco) -> bool {
        self.index.contains_key(&sco)
    }

    fn entry(&self, h: CacheHandle) -> Option<&Entry> {
        match self.slots.get(h.index as usize) {
            Some(Slot::Occupied(e)) if e.generation == h.generation => Some(e),
            _ => None,
        }
    }

    pub fn is_disposable(&self, sco: Sco) -> Option<bool> {
        let h = self.lookup(sco)?;
        self.entry(h).map(|e| e.disposable)
    }

    /// Marks a SCO disposable exactly when both its backend upload and
    /// its originating TLog's backend upload are confirmed.
    pub fn mark_disposable(&mut self, sco: Sco) {
        if let Some(&index) = self.index.get(&sco) {
            if let Slot::Occupied(e) = &mut self.slots[index as usize] {
                if !e.disposable {
                    e.disposable = true;
                    self.non_disposable_bytes = self.non_disposable_bytes.saturating_sub(e.size_bytes);
                }
            }
        }
    }

    pub fn touch(&mut self, sco: Sco) {
        if let Some(&index) = self.index.get(&sco) {
            if let Slot::Occupied(e) = &mut self.slots[index as usize] {
                e.last_access = Instant::now();
            }
            self.move_to_front(index);
        }
    }

    /// Evicts the least-recently-used disposable SCO. Nondisposable SCOs
    /// are never evicted.
    pub fn evict_one(&mut self) -> Option<Sco> {
        let mut cursor = self.lru_tail;
        while let Some(index) = cursor {
            let (disposable, sco, prev) = match &self.slots[index as usize] {
                Slot::Occupied(e) => (e.disposable, e.sco, e.prev),
                Slot::Vacant { .. } => unreachable!(),
            };
            if disposable {
                self.remove_index(index);
                return Some(sco);
            }
            cursor = prev;
        }
        None
    }

    /// Removes a SCO from the cache outright. Refuses to remove a
    /// nondisposable SCO unless `remove_nondisposable` is set, matching
    /// `DataStoreNG::removeSCO`'s `removeNonDisposable` flag.
    pub fn remove(&mut self, sco: Sco, remove_nondisposable: bool) -> bool {
        let Some(&index) = self.index.get(&sco) else {
            return false;
        };
        let disposable = match &self.slots[index as usize] {
            Slot::Occupied(e) => e.disposable,
            Slot::Vacant { .. } => unreachable!(),
        };
        if !disposable && !remove_nondisposable {
            return false;
        }
        self.remove_index(index);
        true
    }

    fn remove_index(&mut self, index: u32) {
        let entry = match std::mem::replace(
            &mut self.slots[index as usize],
            Slot::Vacant {
                next_free: None,
                generation: 0,
            },
        ) {
            Slot::Occupied(e) => e,
            Slot::Vacant { .. } => unreachable!(),
        };
        self.unlink(index, entry.prev, entry.next);
        self.index.remove(&entry.sco);
        if let Some(mp) = self.mountpoint_mut(entry.mountpoint) {
            mp.used_bytes = mp.used_bytes.saturating_sub(entry.size_bytes);
        }
        if !entry.disposable {
            self.non_disposable_bytes = self.non_disposable_bytes.saturating_sub(entry.size_bytes);
        }
        self.slots[index as usize] = Slot::Vacant {
            next_free: self.free_head,
            generation: entry.generation.wrapping_add(1),
        };
        self.free_head = Some(index);
    }

    fn unlink(&mut self, _index: u32, prev: Option<u32>, next: Option<u32>) {
        match prev {
            Some(p) => {
                if let Slot::Occupied(e) = &mut self.slots[p as usize] {
                    e.next = next;
                }
            }
            None => self.lru_head = next,
        }
        match next {
            Some(n) => {
                if let Slot::Occupied(e) = &mut self.slots[n as usize] {
                    e.prev = prev;
                }
            }
            None => self.lru_tail = prev,
        }
    }

    fn push_front(&mut self, index: u32) {
        let old_head = self.lru_head;
        if let Slot::Occupied(e) = &mut self.slots[index as usize] {
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            if let Slot::Occupied(e) = &mut self.slots[h as usize] {
                e.prev = Some(index);
            }
        }
        self.lru_head = Some(index);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(index);
        }
    }

    fn move_to_front(&mut self, index: u32) {
        if self.lru_head == Some(index) {
            return;
        }
        let (prev, next) = match &self.slots[index as usize] {
            Slot::Occupied(e) => (e.prev, e.next),
            Slot::Vacant { .. } => return,
        };
        self.unlink(index, prev, next);
        self.push_front(index);
    }

    pub fn scos(&self) -> impl Iterator<Item = Sco> + '_ {
        self.index.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(id: MountPointId, capacity: u64) -> MountPoint {
        MountPoint {
            id,
            path: PathBuf::from(format!("/mnt/{id}")),
            capacity_bytes: capacity,
            trigger_gap_bytes: 0,
            used_bytes: 0,
            offline: false,
        }
    }

    #[test]
    fn lru_evicts_only_disposable_entries() {
        let mut cache = ScoCache::new(vec![mp(0, 1_000_000)]);
        let a = Sco::own(1);
        let b = Sco::own(2);
        cache.insert(a, 0, 100);
        cache.insert(b, 0, 100);
        // `a` is nondisposable: must not be evicted.
        assert_eq!(cache.evict_one(), None);
        cache.mark_disposable(a);
        assert_eq!(cache.evict_one(), Some(a));
        assert!(!cache.contains(a));
        assert!(cache.contains(b));
    }

    #[test]
    fn touch_moves_entry_to_front_of_lru() {
        let mut cache = ScoCache::new(vec![mp(0, 1_000_000)]);
        let a = Sco::own(1);
        let b = Sco::own(2);
        cache.insert(a, 0, 10);
        cache.insert(b, 0, 10);
        cache.mark_disposable(a);
        cache.mark_disposable(b);
        cache.touch(a); // a is now most-recently-used; b should evict first
        assert_eq!(cache.evict_one(), Some(b));
        assert_eq!(cache.evict_one(), Some(a));
    }

    #[test]
    fn non_disposable_bytes_tracks_dirty_usage() {
        let mut cache = ScoCache::new(vec![mp(0, 1_000_000)]);
        let a = Sco::own(1);
        cache.insert(a, 0, 500);
        assert_eq!(cache.non_disposable_bytes(), 500);
        cache.mark_disposable(a);
        assert_eq!(cache.non_disposable_bytes(), 0);
    }

    #[test]
    fn stale_handle_is_not_confused_with_reused_slot() {
        let mut cache = ScoCache::new(vec![mp(0, 1_000_000)]);
        let a = Sco::own(1);
        let h1 = cache.insert(a, 0, 10);
        cache.mark_disposable(a);
        cache.remove(a, false);
        let b = Sco::own(2);
        let h2 = cache.insert(b, 0, 10);
        assert_eq!(h1.index, h2.index);
        assert_ne!(h1.generation, h2.generation);
    }
}
