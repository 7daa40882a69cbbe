//! Owns the snapshots manifest and the current TLog writer for one
//! volume. Schedules TLog and manifest uploads through an
//! injected [`TaskScheduler`] rather than depending on the concurrency
//! crate's pool implementation directly.

use crate::manifest::{SnapshotPersistor, MANIFEST_OBJECT_NAME};
use crate::tlog::{self, TlogWriter};
use novastore_core::backend::{Backend, OverwriteObject, WriteCondition};
use novastore_core::error::{Error, Result};
use novastore_core::tasks::{Task, TaskScheduler};
use novastore_core::types::{ClusterLocation, ParentRef, ScoNumber, ScrubId, Snapshot, SnapshotNum};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Forwarded to the volume once a TLog's upload and manifest update are
/// both confirmed. Volume
/// implements this to fan the notification out to DataStore, the DTL
/// bridge, and MetaDataStore.
pub trait TlogWrittenObserver: Send + Sync {
    fn on_tlog_written(&self, tlog_id: Uuid, last_sco_in_tlog: ScoNumber) -> Result<()>;
}

struct Inner {
    manifest: SnapshotPersistor,
    current: TlogWriter,
}

pub struct SnapshotManagement {
    dir: PathBuf,
    backend: Arc<dyn Backend>,
    scheduler: Arc<dyn TaskScheduler>,
    owner_tag: String,
    max_entries_per_tlog: AtomicU64,
    inner: Mutex<Inner>,
}

impl SnapshotManagement {
    /// Fresh volume: an empty manifest and a brand-new current TLog
    ///.
    pub fn new_volume(
        dir: PathBuf,
        backend: Arc<dyn Backend>,
        scheduler: Arc<dyn TaskScheduler>,
        owner_tag: String,
        max_entries_per_tlog: u64,
        parent: Option<ParentRef>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut manifest = SnapshotPersistor::new(parent);
        let tlog_id = Uuid::new_v4();
        manifest.current_tlogs.push(tlog_id);
        let current = TlogWriter::create(&dir, tlog_id, max_entries_per_tlog)?;
        manifest.write_to(&dir.join(MANIFEST_OBJECT_NAME))?;
        Ok(Self {
            dir,
            backend,
            scheduler,
            owner_tag,
            max_entries_per_tlog: AtomicU64::new(max_entries_per_tlog),
            inner: Mutex::new(Inner { manifest, current }),
        })
    }

    /// Reopens from a manifest already present on local disk (restart
    /// paths construct the manifest themselves and call this).
    pub fn from_existing(
        dir: PathBuf,
        backend: Arc<dyn Backend>,
        scheduler: Arc<dyn TaskScheduler>,
        owner_tag: String,
        max_entries_per_tlog: u64,
        manifest: SnapshotPersistor,
    ) -> Result<Self> {
        let tlog_id = *manifest
            .current_tlogs
            .last()
            .ok_or_else(|| Error::Corruption("manifest has no current TLog".into()))?;
        let current = TlogWriter::create(&dir, tlog_id, max_entries_per_tlog)?;
        Ok(Self {
            dir,
            backend,
            scheduler,
            owner_tag,
            max_entries_per_tlog: AtomicU64::new(max_entries_per_tlog),
            inner: Mutex::new(Inner { manifest, current }),
        })
    }

    pub fn current_tlog_id(&self) -> Uuid {
        self.inner.lock().current.id
    }

    /// Takes effect from the next TLog rollover on; the TLog currently
    /// open keeps its original capacity.
    pub fn set_max_entries_per_tlog(&self, n: u64) {
        self.max_entries_per_tlog.store(n, Ordering::Relaxed);
    }

    fn persist_manifest_locally(&self, inner: &Inner) -> Result<()> {
        inner.manifest.write_to(&self.dir.join(MANIFEST_OBJECT_NAME))
    }

    fn schedule_manifest_upload(&self) {
        let local_path = self.dir.join(MANIFEST_OBJECT_NAME);
        self.scheduler.schedule(Task::WriteSnapshot {
            local_path,
            expected_tag: Some(self.owner_tag.clone()),
        });
    }

    fn schedule_tlog_upload(&self, tlog_id: Uuid) {
        let local_path = self.dir.join(tlog::object_name(tlog_id));
        self.scheduler.schedule(Task::WriteTlog { tlog_id, local_path });
    }

    /// Appends a cluster-location entry; rolls the TLog if it is now
    /// full.
    pub fn add_cluster_entry(&self, ca: u64, loc: ClusterLocation, hash: Option<[u8; 32]>) -> Result<()> {
        let mut inner = self.inner.lock();
        let full = inner.current.add_cluster_entry(ca, loc, hash)?;
        if full {
            self.roll_tlog(&mut inner)?;
        }
        Ok(())
    }

    pub fn add_sco_crc(&self, crc: u32) -> Result<()> {
        self.inner.lock().current.add_sco_crc(crc)
    }

    pub fn sync(&self, maybe_sco_crc: Option<u32>) -> Result<()> {
        self.inner.lock().current.sync(maybe_sco_crc)
    }

    /// No cluster entry may be appended between closing the old TLog and
    /// opening the new one; both happen
    /// while holding the manifest lock.
    fn roll_tlog(&self, inner: &mut Inner) -> Result<()> {
        let old_id = inner.current.id;
        inner.current.sync(None)?;
        self.schedule_tlog_upload(old_id);

        let new_id = Uuid::new_v4();
        let new_writer = TlogWriter::create(&self.dir, new_id, self.max_entries_per_tlog.load(Ordering::Relaxed))
            .map_err(|e| Error::TlogRolloverFailed(e.to_string()))?;
        let old_writer = std::mem::replace(&mut inner.current, new_writer);
        drop(old_writer);

        inner.manifest.current_tlogs.push(new_id);
        self.persist_manifest_locally(inner)?;
        self.schedule_manifest_upload();
        info!(old = %old_id, new = %new_id, "rolled TLog");
        Ok(())
    }

    /// Appends a CRC (if any), rolls the TLog, persists a new snapshot
    /// into the manifest, and schedules both uploads.
    pub fn create_snapshot(&self, name: &str, maybe_sco_crc: Option<u32>, metadata: Vec<u8>, uuid: Uuid) -> Result<SnapshotNum> {
        let mut inner = self.inner.lock();
        if inner.manifest.find(name).is_some() {
            return Err(Error::SnapshotAlreadyExists(name.to_string()));
        }
        if let Some(crc) = maybe_sco_crc {
            inner.current.add_sco_crc(crc)?;
        }
        let closing_tlogs = inner.manifest.current_tlogs.clone();
        self.roll_tlog(&mut inner)?;
        // Everything that just closed now belongs to this snapshot; only
        // the freshly-opened TLog remains "current".
        inner.manifest.current_tlogs = vec![inner.current.id];

        let num = inner.manifest.next_num();
        let snapshot = Snapshot {
            name: name.to_string(),
            num,
            uuid,
            parent: inner.manifest.snapshots.last().map(|s| s.num),
            metadata,
            backend_size: 0,
            scrubbed: false,
            in_backend: false,
            tlogs: closing_tlogs,
            deleted: false,
        };
        inner.manifest.snapshots.push(snapshot);
        self.persist_manifest_locally(&inner)?;
        self.schedule_manifest_upload();
        info!(snapshot = name, num, "created snapshot");
        Ok(num)
    }

    /// Tombstones a snapshot; the TLog/SCO garbage is reclaimed by the
    /// scrubber, not here.
    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let snapshot = inner
            .manifest
            .find_mut(name)
            .ok_or_else(|| Error::SnapshotNotFound(name.to_string()))?;
        snapshot.deleted = true;
        self.persist_manifest_locally(&inner)?;
        self.schedule_manifest_upload();
        Ok(())
    }

    /// Erases snapshots and TLogs after `num` locally, closes and
    /// reopens the current TLog. Returns
    /// the TLog ids that became orphaned so the caller can schedule
    /// their backend deletion.
    pub fn restore_snapshot(&self, num: SnapshotNum) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.lock();
        let target = inner
            .manifest
            .by_num(num)
            .ok_or_else(|| Error::SnapshotNotFound(num.to_string()))?;
        if !target.in_backend {
            return Err(Error::SnapshotNotInBackend(num.to_string()));
        }

        let orphaned_tlogs: Vec<Uuid> = inner
            .manifest
            .snapshots
            .iter()
            .filter(|s| s.num > num)
            .flat_map(|s| s.tlogs.clone())
            .chain(inner.manifest.current_tlogs.iter().copied())
            .collect();

        inner.manifest.truncate_after(num);

        let new_id = Uuid::new_v4();
        let new_writer = TlogWriter::create(&self.dir, new_id, self.max_entries_per_tlog.load(Ordering::Relaxed))?;
        inner.current = new_writer;
        inner.manifest.current_tlogs = vec![new_id];

        self.persist_manifest_locally(&inner)?;
        self.schedule_manifest_upload();
        warn!(num, orphaned = orphaned_tlogs.len(), "restored snapshot");
        Ok(orphaned_tlogs)
    }

    /// Full `tlog_written_to_backend_callback` flow: flip
    /// the durability flag in an in-memory copy, upload it with
    /// `OverwriteObject::T`, then commit the flip to the authoritative
    /// manifest, persist locally, and notify the observer so it can
    /// forward to DataStore/DTL/MetaDataStore.
    pub fn tlog_written_to_backend_callback(
        &self,
        tlog_id: Uuid,
        last_sco_in_tlog: ScoNumber,
        observer: &dyn TlogWrittenObserver,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut staged = inner.manifest.clone();
        mark_tlog_durable(&mut staged, tlog_id);
        let staged_path = self.dir.join(format!("{MANIFEST_OBJECT_NAME}.staged"));
        staged.write_to(&staged_path)?;
        self.backend.write(
            &staged_path,
            MANIFEST_OBJECT_NAME,
            OverwriteObject::T,
            None,
            WriteCondition::ExpectedTag(self.owner_tag.clone()),
        )?;
        std::fs::remove_file(&staged_path).ok();

        mark_tlog_durable(&mut inner.manifest, tlog_id);
        self.persist_manifest_locally(&inner)?;
        std::fs::remove_file(self.dir.join(tlog::object_name(tlog_id))).ok();

        drop(inner);
        observer.on_tlog_written(tlog_id, last_sco_in_tlog)
    }

    pub fn get_scrubbing_work(&self, start: Option<SnapshotNum>, end: Option<SnapshotNum>) -> Vec<String> {
        self.inner.lock().manifest.scrubbing_work(start, end)
    }

    /// Transactional swap of a snapshot's TLog set for its scrubbed
    /// replacement, issuing a new scrub id.
    pub fn replace_tlogs_with_scrubbed(&self, tlogs_in: &[Uuid], tlogs_out: Vec<Uuid>, snap_num: SnapshotNum) -> Result<ScrubId> {
        let mut inner = self.inner.lock();
        let snapshot = inner
            .manifest
            .snapshots
            .iter_mut()
            .find(|s| s.num == snap_num)
            .ok_or_else(|| Error::SnapshotNotFound(snap_num.to_string()))?;
        if !tlogs_in.iter().all(|id| snapshot.tlogs.contains(id)) {
            return Err(Error::InvalidArgument("tlogs_in does not match the snapshot's current TLog set".into()));
        }
        snapshot.tlogs.retain(|id| !tlogs_in.contains(id));
        snapshot.tlogs.extend(tlogs_out);
        snapshot.scrubbed = true;

        let new_scrub_id = inner.manifest.scrub_id.next();
        inner.manifest.scrub_id = new_scrub_id.clone();
        self.persist_manifest_locally(&inner)?;
        self.schedule_manifest_upload();
        Ok(new_scrub_id)
    }

    pub fn manifest_snapshot(&self) -> SnapshotPersistor {
        self.inner.lock().manifest.clone()
    }
}

fn mark_tlog_durable(manifest: &mut SnapshotPersistor, tlog_id: Uuid) {
    if !manifest.durable_tlogs.contains(&tlog_id) {
        manifest.durable_tlogs.push(tlog_id);
    }
    for snapshot in manifest.snapshots.iter_mut() {
        if !snapshot.in_backend && snapshot.tlogs.iter().all(|id| manifest.durable_tlogs.contains(id)) {
            snapshot.in_backend = true;
        }
    }
}
