//! The snapshots manifest ("snapshots.xml" on the backend; here an
//! `rmp-serde`-encoded document with an explicit version field checked
//! on load).

use novastore_core::error::{Error, Result};
use novastore_core::types::{ParentRef, ScrubId, Snapshot, SnapshotNum};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

pub const MANIFEST_OBJECT_NAME: &str = "snapshots.xml";
const CURRENT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPersistor {
    pub version: u16,
    pub parent: Option<ParentRef>,
    pub snapshots: Vec<Snapshot>,
    /// TLog ids belonging to the currently-open, not-yet-snapshotted set.
    pub current_tlogs: Vec<Uuid>,
    /// TLog ids confirmed written to the backend. A snapshot becomes
    /// `in_backend` once every id in its `tlogs` set appears here.
    pub durable_tlogs: Vec<Uuid>,
    pub scrub_id: ScrubId,
}

impl SnapshotPersistor {
    pub fn new(parent: Option<ParentRef>) -> Self {
        Self {
            version: CURRENT_VERSION,
            parent,
            snapshots: Vec::new(),
            current_tlogs: Vec::new(),
            durable_tlogs: Vec::new(),
            scrub_id: ScrubId::initial(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let persistor: Self = rmp_serde::from_slice(bytes)?;
        if persistor.version != CURRENT_VERSION {
            return Err(Error::Corruption(format!(
                "snapshots manifest version mismatch: expected {CURRENT_VERSION}, found {}",
                persistor.version
            )));
        }
        Ok(persistor)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn find(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.name == name && !s.deleted)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Snapshot> {
        self.snapshots.iter_mut().find(|s| s.name == name && !s.deleted)
    }

    pub fn by_num(&self, num: SnapshotNum) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.num == num)
    }

    pub fn next_num(&self) -> SnapshotNum {
        self.snapshots.iter().map(|s| s.num).max().map(|n| n + 1).unwrap_or(1)
    }

    /// Snapshots in `(start, end]` that are durable and not yet scrubbed
    ///.
    pub fn scrubbing_work(&self, start: Option<SnapshotNum>, end: Option<SnapshotNum>) -> Vec<String> {
        let lo = start.unwrap_or(0);
        self.snapshots
            .iter()
            .filter(|s| s.num > lo && end.map(|hi| s.num <= hi).unwrap_or(true))
            .filter(|s| s.in_backend && !s.scrubbed)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Truncates the snapshot list and current TLog set to everything at
    /// or before `num`, for `restore_snapshot`.
    pub fn truncate_after(&mut self, num: SnapshotNum) {
        self.snapshots.retain(|s| s.num <= num);
    }
}
