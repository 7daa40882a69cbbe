//! Wraps a remote [`DtlClient`] with the Sync/Async replication modes
//! and the degraded-mode state machine a volume needs on top of it. The
//! bridge itself stays synchronous from the volume's point of view;
//! `Async` mode runs the network round trip on a dedicated tokio
//! runtime thread so a slow remote doesn't stall the write path.

use novastore_core::backend::{DtlClient, DtlRecord};
use novastore_core::config::{DtlMode, FailOverCacheConfig};
use novastore_core::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Replication state as seen by the write path. `OkStandalone` means no
/// backup target is configured at all; `Degraded` means one is
/// configured but unreachable, so writes fall back to the primary
/// backend's own durability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlState {
    OkStandalone,
    OkSync,
    /// Reconnected but still replaying the backlog accumulated while
    /// degraded.
    Ketchup,
    Degraded,
}

type DegradedCallback = dyn Fn() + Send + Sync;

struct AsyncWorker {
    runtime: tokio::runtime::Runtime,
}

/// Client-side half of the DTL replication link: holds the active [`DtlClient`] proxy,
/// tracks [`DtlState`], and in `Async` mode batches writes in the
/// background.
pub struct DtlBridge {
    config: FailOverCacheConfig,
    state: RwLock<DtlState>,
    proxy: RwLock<Option<Arc<dyn DtlClient>>>,
    degraded_callback: Mutex<Option<Box<DegradedCallback>>>,
    pending: Mutex<VecDeque<DtlRecord>>,
    async_worker: Option<AsyncWorker>,
    closed: AtomicBool,
}

impl DtlBridge {
    pub fn new(config: FailOverCacheConfig) -> Self {
        let async_worker = match config.mode {
            DtlMode::Async => tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .ok()
                .map(|runtime| AsyncWorker { runtime }),
            DtlMode::Sync => None,
        };
        Self {
            config,
            state: RwLock::new(DtlState::OkStandalone),
            proxy: RwLock::new(None),
            degraded_callback: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            async_worker,
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DtlState {
        *self.state.read()
    }

    /// Registers the callback invoked the moment the bridge transitions
    /// into [`DtlState::Degraded`]. Volumes use this to stop treating
    /// local-only writes as durable-enough for synchronous mode.
    pub fn set_degraded_callback(&self, callback: Box<DegradedCallback>) {
        *self.degraded_callback.lock() = Some(callback);
    }

    fn enter_degraded(&self) {
        let mut state = self.state.write();
        if *state != DtlState::Degraded {
            *state = DtlState::Degraded;
            drop(state);
            warn!("DTL bridge entering degraded mode");
            if let Some(cb) = self.degraded_callback.lock().as_ref() {
                cb();
            }
        }
    }

    /// Installs a new remote proxy, tearing down any prior failover
    /// directory first. Transitions to `Ketchup` so callers know a
    /// backlog replay may still be pending before steady-state `OkSync`.
    pub fn new_cache(&self, proxy: Arc<dyn DtlClient>) -> Result<()> {
        if let Some(old) = self.proxy.write().take() {
            let _ = old.delete_failover_dir();
        }
        proxy.set_request_timeout(self.config.request_timeout_s);
        *self.proxy.write() = Some(proxy);
        *self.state.write() = DtlState::Ketchup;
        Ok(())
    }

    /// The active remote proxy, if a DTL is configured; used by the
    /// volume's read path to fall back to the DTL for SCOs newer than
    /// the backend's high-water mark.
    pub fn client(&self) -> Option<Arc<dyn DtlClient>> {
        self.proxy.read().clone()
    }

    pub fn clear_cache(&self) {
        *self.proxy.write() = None;
        *self.state.write() = DtlState::OkStandalone;
        self.pending.lock().clear();
    }

    /// Replicates `records`. Returns `Ok(true)` if they are now durable
    /// on the remote (or there is no remote configured), `Ok(false)` if
    /// the async queue is backpressured and the caller should retry.
    pub fn add_entries(&self, records: &[DtlRecord]) -> Result<bool> {
        let proxy = match self.proxy.read().clone() {
            Some(p) => p,
            None => return Ok(true),
        };
        match self.config.mode {
            DtlMode::Sync => match proxy.add_entries(records) {
                Ok(ok) => {
                    *self.state.write() = DtlState::OkSync;
                    Ok(ok)
                }
                Err(e) => {
                    self.enter_degraded();
                    Err(e)
                }
            },
            DtlMode::Async => self.add_entries_async(proxy, records),
        }
    }

    fn add_entries_async(&self, proxy: Arc<dyn DtlClient>, records: &[DtlRecord]) -> Result<bool> {
        let mut pending = self.pending.lock();
        if pending.len() + records.len() > self.config.queue_depth {
            return Ok(false);
        }
        pending.extend(records.iter().cloned());
        let should_flush = pending.len() >= self.config.write_trigger;
        let batch: Vec<DtlRecord> = if should_flush { pending.drain(..).collect() } else { Vec::new() };
        drop(pending);

        if batch.is_empty() {
            return Ok(true);
        }
        self.flush_batch(proxy, batch)
    }

    fn flush_batch(&self, proxy: Arc<dyn DtlClient>, batch: Vec<DtlRecord>) -> Result<bool> {
        let worker = match &self.async_worker {
            Some(w) => w,
            None => return proxy.add_entries(&batch),
        };
        let timeout = Duration::from_secs(self.config.request_timeout_s);
        let result = worker.runtime.block_on(async move {
            tokio::time::timeout(timeout, async { proxy.add_entries(&batch) })
                .await
                .map_err(|_| Error::Backend("DTL flush timed out".to_string()))?
        });
        match result {
            Ok(ok) => {
                *self.state.write() = DtlState::OkSync;
                Ok(ok)
            }
            Err(e) => {
                self.enter_degraded();
                Err(e)
            }
        }
    }

    /// Forces a flush of whatever is queued, used on explicit `sync()`
    /// calls from the volume.
    pub fn flush(&self) -> Result<()> {
        let proxy = match self.proxy.read().clone() {
            Some(p) => p,
            None => return Ok(()),
        };
        let batch: Vec<DtlRecord> = self.pending.lock().drain(..).collect();
        if !batch.is_empty() {
            self.flush_batch(proxy.clone(), batch)?;
        }
        proxy.flush()
    }

    pub fn remove_up_to(&self, sco: novastore_core::types::Sco) -> Result<()> {
        match self.proxy.read().clone() {
            Some(p) => p.remove_up_to(sco),
            None => Ok(()),
        }
    }

    pub fn replay(&self, callback: &mut dyn FnMut(DtlRecord) -> Result<()>) -> Result<()> {
        match self.proxy.read().clone() {
            Some(p) => {
                p.replay(callback)?;
                *self.state.write() = DtlState::OkSync;
                info!("DTL backlog replay complete");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novastore_core::types::{ClusterLocation, Sco};
    use std::sync::atomic::AtomicUsize;

    struct FlakyDtl {
        fail: AtomicBool,
    }
    impl DtlClient for FlakyDtl {
        fn add_entries(&self, _records: &[DtlRecord]) -> Result<bool> {
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::Backend("unreachable".into()))
            } else {
                Ok(true)
            }
        }
        fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn clear(&self) -> Result<()> {
            Ok(())
        }
        fn remove_up_to(&self, _sco: Sco) -> Result<()> {
            Ok(())
        }
        fn get_sco_range(&self) -> Result<Option<(Sco, Sco)>> {
            Ok(None)
        }
        fn get_sco_from_failover(&self, _sco: Sco, _sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
            Ok(())
        }
        fn set_request_timeout(&self, _secs: u64) {}
        fn delete_failover_dir(&self) -> Result<()> {
            Ok(())
        }
        fn replay(&self, _callback: &mut dyn FnMut(DtlRecord) -> Result<()>) -> Result<()> {
            Ok(())
        }
    }

    fn record() -> DtlRecord {
        DtlRecord {
            loc: ClusterLocation::new(Sco::own(1), 0),
            lba: 0,
            payload: vec![0u8; 16],
        }
    }

    #[test]
    fn no_proxy_configured_is_standalone_and_always_succeeds() {
        let bridge = DtlBridge::new(FailOverCacheConfig::default());
        assert_eq!(bridge.state(), DtlState::OkStandalone);
        assert!(bridge.add_entries(&[record()]).unwrap());
    }

    #[test]
    fn sync_failure_enters_degraded_and_invokes_callback() {
        let bridge = DtlBridge::new(FailOverCacheConfig::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        bridge.set_degraded_callback(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        let proxy = Arc::new(FlakyDtl { fail: AtomicBool::new(true) });
        bridge.new_cache(proxy).unwrap();
        assert!(bridge.add_entries(&[record()]).is_err());
        assert_eq!(bridge.state(), DtlState::Degraded);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sync_success_reports_ok_sync() {
        let bridge = DtlBridge::new(FailOverCacheConfig::default());
        let proxy = Arc::new(FlakyDtl { fail: AtomicBool::new(false) });
        bridge.new_cache(proxy).unwrap();
        assert!(bridge.add_entries(&[record()]).unwrap());
        assert_eq!(bridge.state(), DtlState::OkSync);
    }
}
