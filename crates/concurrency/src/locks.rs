//! Per-volume locking: a write lock serializing cluster writers against
//! each other, and a management read/write lock that lets concurrent
//! reads and writes proceed while an exclusive management operation
//! (snapshot restore, resize, halt) runs.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Mutex as StdMutex;

/// Serializes writers to the same volume. A plain mutex rather than a
/// range lock: clusters within one volume are small enough that
/// per-range locking isn't worth the bookkeeping.
pub struct WriteLock(StdMutex<()>);

impl Default for WriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteLock {
    pub fn new() -> Self {
        Self(StdMutex::new(()))
    }

    pub fn lock(&self) -> WriteLockGuard<'_> {
        WriteLockGuard(self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

pub struct WriteLockGuard<'a>(std::sync::MutexGuard<'a, ()>);

/// Guards a volume against concurrent management operations
/// (`create_snapshot`, `restore_snapshot`, `resize`, ...) while letting
/// ordinary reads and writes proceed unimpeded; a management operation
/// takes the exclusive side.
pub struct ManagementLock(RwLock<()>);

impl Default for ManagementLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagementLock {
    pub fn new() -> Self {
        Self(RwLock::new(()))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn write_lock_serializes_concurrent_increments() {
        let lock = Arc::new(WriteLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock.lock();
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8000);
    }

    #[test]
    fn management_lock_allows_concurrent_readers() {
        let lock = Arc::new(ManagementLock::new());
        let g1 = lock.read();
        let g2 = lock.read();
        drop(g1);
        drop(g2);
        let _exclusive = lock.exclusive();
    }
}
