//! Single owner of the current open SCO and the local SCO cache for one
//! volume.

use crate::open_sco::OpenSco;
use crate::sco_cache::{MountPoint, ScoCache};
use novastore_core::backend::{Backend, DtlClient, OverwriteObject, PartialReadSpec, WriteCondition};
use novastore_core::error::{Error, Result};
use novastore_core::types::{ClusterAddress, ClusterLocation, Sco, ScoNumber};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

/// A cluster's destination within a batch read.
pub struct ReadDesc<'a> {
    pub loc: ClusterLocation,
    pub ca: ClusterAddress,
    pub buf: &'a mut [u8],
}

/// Returned from [`DataStore::write_clusters`] when the write filled the
/// current SCO and triggered a rollover; the caller (SnapshotManagement,
/// via Volume) records the checksum in the TLog and schedules the
/// upload task.
#[derive(Debug, Clone, Copy)]
pub struct FinalizedSco {
    pub sco: Sco,
    pub checksum: u32,
}

pub struct DataStore {
    dir: PathBuf,
    cluster_size: u32,
    sco_capacity_bytes: u64,
    current: Option<OpenSco>,
    next_number: ScoNumber,
    cache: Mutex<ScoCache>,
    /// Highest-numbered SCO confirmed written to the backend. SCOs newer
    /// than this are either still local or must come from the DTL.
    latest_sco_in_backend: AtomicU64,
    error_lock: Mutex<()>,
    offline_mountpoints: Mutex<Vec<u32>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl DataStore {
    pub fn new(dir: PathBuf, cluster_size: u32, sco_multiplier: u32, mountpoints: Vec<MountPoint>) -> Self {
        std::fs::create_dir_all(&dir).ok();
        Self {
            dir,
            cluster_size,
            sco_capacity_bytes: cluster_size as u64 * sco_multiplier as u64,
            current: None,
            next_number: 1,
            cache: Mutex::new(ScoCache::new(mountpoints)),
            latest_sco_in_backend: AtomicU64::new(0),
            error_lock: Mutex::new(()),
            offline_mountpoints: Mutex::new(Vec::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size
    }

    /// Changes the capacity of SCOs opened from now on; the currently
    /// open SCO keeps its original capacity.
    pub fn set_sco_multiplier(&mut self, sco_multiplier: u32) {
        self.sco_capacity_bytes = self.cluster_size as u64 * sco_multiplier as u64;
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn current_sco_number(&self) -> ScoNumber {
        self.current.as_ref().map(|s| s.sco.number).unwrap_or(self.next_number)
    }

    fn open_new_sco(&mut self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let mp = cache
            .pick_mountpoint(self.sco_capacity_bytes)
            .ok_or(Error::ScoCacheFull)?;
        let sco = Sco::own(self.next_number);
        self.next_number += 1;
        let open = OpenSco::create(&self.dir, sco, self.sco_capacity_bytes)?;
        cache.insert(sco, mp, 0);
        self.current = Some(open);
        info!(sco = %sco, "opened new SCO");
        Ok(())
    }

    /// `new_volume`: first SCO starts at number 1, offset 0.
    pub fn new_volume(&mut self) -> Result<()> {
        self.next_number = 1;
        self.open_new_sco()
    }

    /// Writes `n` contiguous clusters starting at the current SCO offset.
    /// Returns the allocated locations and, if the write filled the SCO,
    /// the [`FinalizedSco`] the caller must record and schedule for
    /// upload.
    pub fn write_clusters(&mut self, buf: &[u8], n: usize) -> Result<(Vec<ClusterLocation>, Option<FinalizedSco>)> {
        assert_eq!(buf.len(), n * self.cluster_size as usize);
        if self.current.is_none() {
            self.open_new_sco()?;
        }

        let mut locs = Vec::with_capacity(n);
        let mut finalized = None;
        let cs = self.cluster_size as usize;

        for i in 0..n {
            let payload = &buf[i * cs..(i + 1) * cs];
            let open = self.current.as_mut().expect("current SCO is always open here");
            let loc = open.append_cluster(payload, self.cluster_size)?;
            locs.push(loc);

            let remaining = self.current.as_ref().unwrap().remaining_bytes();
            if remaining == 0 {
                let old = self.current.take().unwrap();
                let sco = old.sco;
                if let Some(checksum) = old.finalize()? {
                    finalized = Some(FinalizedSco { sco, checksum });
                }
                self.open_new_sco()?;
            }
        }

        Ok((locs, finalized))
    }

    /// Forced placement for DTL replay: location must equal the current
    /// cluster location.
    pub fn write_cluster_to_location(&mut self, buf: &[u8], loc: ClusterLocation) -> Result<()> {
        let open = self
            .current
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("no SCO currently open".into()))?;
        open.write_at_current_offset(buf, loc, self.cluster_size)
    }

    pub fn sync(&mut self) -> Result<Option<u32>> {
        match self.current.as_mut() {
            Some(open) => Ok(Some(open.sync()?)),
            None => Ok(None),
        }
    }

    /// Idempotent: returns `None` if the current SCO is empty.
    pub fn finalize_current_sco(&mut self) -> Result<Option<FinalizedSco>> {
        let Some(open) = self.current.take() else {
            return Ok(None);
        };
        let sco = open.sco;
        let checksum = open.finalize()?;
        self.open_new_sco()?;
        Ok(checksum.map(|checksum| FinalizedSco { sco, checksum }))
    }

    pub fn touch_cluster(&self, loc: ClusterLocation) {
        self.cache.lock().unwrap().touch(loc.sco);
    }

    /// Called once a TLog referencing `sco` and the SCO itself are both
    /// confirmed durable in the backend.
    pub fn mark_disposable(&self, sco: Sco) {
        self.cache.lock().unwrap().mark_disposable(sco);
    }

    /// Marks every cached own-namespace SCO at or below `sco_number` as
    /// disposable; called once the TLog covering them is confirmed
    /// durable in the backend.
    pub fn mark_disposable_up_to(&self, sco_number: ScoNumber) {
        let mut cache = self.cache.lock().unwrap();
        let known: Vec<Sco> = cache.scos().collect();
        for sco in known {
            if sco.clone_id == 0 && sco.number <= sco_number {
                cache.mark_disposable(sco);
            }
        }
    }

    pub fn set_latest_sco_in_backend(&self, sco: ScoNumber) {
        self.latest_sco_in_backend.fetch_max(sco as u64, Ordering::SeqCst);
    }

    pub fn latest_sco_in_backend(&self) -> ScoNumber {
        self.latest_sco_in_backend.load(Ordering::SeqCst) as ScoNumber
    }

    pub fn remove_sco(&self, sco: Sco, remove_nondisposable: bool) -> bool {
        let removed = self.cache.lock().unwrap().remove(sco, remove_nondisposable);
        if removed {
            std::fs::remove_file(self.dir.join(sco.object_name())).ok();
        }
        removed
    }

    pub fn non_disposable_bytes(&self) -> u64 {
        self.cache.lock().unwrap().non_disposable_bytes()
    }

    /// Resolution order:
    /// 1. currently open SCO, 2. local cache, 3. DTL (if newer than the
    /// backend and not yet acknowledged), 4. backend partial-read with
    /// cache-population fallback.
    pub fn read_clusters(
        &mut self,
        descs: &mut [ReadDesc<'_>],
        backend: Option<&dyn Backend>,
        dtl: Option<&dyn DtlClient>,
    ) -> Result<()> {
        for desc in descs {
            if desc.loc.is_null() {
                desc.buf.fill(0);
                continue;
            }

            if let Some(open) = &self.current {
                if open.sco == desc.loc.sco {
                    open.read_cluster(desc.loc.offset, self.cluster_size, desc.buf)?;
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            if self.cache.lock().unwrap().contains(desc.loc.sco) {
                let path = self.dir.join(desc.loc.sco.object_name());
                if self.read_from_local_file(&path, desc.loc, desc.buf).is_ok() {
                    self.cache.lock().unwrap().touch(desc.loc.sco);
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            if desc.loc.sco.number > self.latest_sco_in_backend() {
                let dtl = dtl.ok_or(Error::DtlImpossibleOffset(desc.loc.sco))?;
                self.fetch_from_dtl(dtl, desc)?;
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let backend = backend.ok_or_else(|| Error::Backend("no backend configured".into()))?;
            self.fetch_from_backend(backend, desc)?;
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_from_local_file(&self, path: &Path, loc: ClusterLocation, buf: &mut [u8]) -> Result<()> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(loc.offset as u64 * self.cluster_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn fetch_from_dtl(&self, dtl: &dyn DtlClient, desc: &mut ReadDesc<'_>) -> Result<()> {
        let mut found = false;
        dtl.get_sco_from_failover(desc.loc.sco, &mut |bytes| {
            let start = desc.loc.offset as usize * self.cluster_size as usize;
            let end = start + self.cluster_size as usize;
            if end <= bytes.len() {
                desc.buf.copy_from_slice(&bytes[start..end]);
                found = true;
            }
            Ok(())
        })?;
        if !found {
            return Err(Error::DtlImpossibleOffset(desc.loc.sco));
        }
        Ok(())
    }

    fn fetch_from_backend(&mut self, backend: &dyn Backend, desc: &mut ReadDesc<'_>) -> Result<()> {
        let name = desc.loc.sco.object_name();
        let local_path = self.dir.join(&name);
        let offset = desc.loc.offset as u64 * self.cluster_size as u64;

        let fallback = |namespace: &str, object_name: &str, insist_on_latest: bool| {
            let _ = (namespace, insist_on_latest);
            warn!(object = object_name, "SCO partial-read miss, populating local cache");
            let dest = self.dir.join(object_name);
            let reader: Box<dyn novastore_core::backend::SeekableRead> =
                Box::new(OpenOptions::new().read(true).open(&dest)?);
            Ok(reader)
        };

        let mut spec = [PartialReadSpec {
            object_name: name.clone(),
            offset,
            size: self.cluster_size as u64,
            buf: &mut *desc.buf,
        }];

        match backend.partial_read(&mut spec, false, &fallback) {
            Ok(()) => {
                self.cache.lock().unwrap().insert(desc.loc.sco, 0, self.sco_capacity_bytes);
                Ok(())
            }
            Err(Error::BackendConnectFailure(msg)) => Err(Error::BackendConnectFailure(msg)),
            Err(e) => Err(e),
        }
    }

    /// `local_restart`: reposition after the last acknowledged
    /// location, repair the straddling SCO, and classify the rest of the
    /// cache by disposability relative to `last_sco_in_backend`.
    pub fn local_restart(&mut self, last_sco_in_backend: ScoNumber, last_loc: ClusterLocation) -> Result<()> {
        self.set_latest_sco_in_backend(last_sco_in_backend);
        self.next_number = last_loc.sco.number + 1;

        let truncate_len = (last_loc.offset as u64 + 1) * self.cluster_size as u64;
        let path = self.dir.join(last_loc.sco.object_name());
        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(truncate_len)?;
        }

        let mut cache = self.cache.lock().unwrap();
        let known: Vec<Sco> = cache.scos().collect();
        for sco in known {
            if sco.number > last_loc.sco.number {
                cache.remove(sco, true);
            } else if sco.number <= last_sco_in_backend {
                cache.mark_disposable(sco);
            }
        }
        drop(cache);
        self.open_new_sco()
    }

    /// `backend_restart`: drop non-disposable local state and any
    /// SCO newer than the backend's high-water mark; the caller restarts
    /// numbering from `last_sco_in_backend + 1`.
    pub fn backend_restart(&mut self, last_sco_in_backend: ScoNumber) -> Result<()> {
        self.set_latest_sco_in_backend(last_sco_in_backend);
        let mut cache = self.cache.lock().unwrap();
        let known: Vec<Sco> = cache.scos().collect();
        for sco in known {
            let disposable = cache.is_disposable(sco).unwrap_or(false);
            if sco.number > last_sco_in_backend || !disposable {
                cache.remove(sco, true);
            }
        }
        drop(cache);
        self.next_number = last_sco_in_backend + 1;
        self.open_new_sco()
    }

    /// `restore_snapshot`: reset to `(snapshot_last_sco + 1, 0)`.
    pub fn restore_snapshot(&mut self, snapshot_last_sco: ScoNumber) -> Result<()> {
        self.next_number = snapshot_last_sco + 1;
        self.current = None;
        self.open_new_sco()
    }

    /// Reports an I/O error on a mountpoint:
    /// offline it under the error lock so exactly one thread drives
    /// recovery; other callers retry against a different mountpoint.
    pub fn report_mountpoint_error(&self, mountpoint: u32) {
        let _guard = self.error_lock.lock().unwrap();
        let mut offline = self.offline_mountpoints.lock().unwrap();
        if !offline.contains(&mountpoint) {
            offline.push(mountpoint);
            if let Some(mp) = self.cache.lock().unwrap().mountpoint_mut(mountpoint) {
                mp.offline = true;
            }
            warn!(mountpoint, "offlined SCO cache mountpoint after I/O error");
        }
    }
}
