//! Offline compaction: replay a snapshot's TLogs, keep only the most
//! recent location per cluster address, re-pack survivors into fresh
//! SCOs one version above their source.

use crate::tlog;
use novastore_core::error::Result;
use novastore_core::types::{ClusterAddress, ClusterLocation, Sco, ScoNumber};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Describes one snapshot's TLog set to compact.
#[derive(Debug, Clone)]
pub struct ScrubWorkUnit {
    pub namespace: String,
    pub snapshot_name: String,
    pub tlog_ids: Vec<Uuid>,
    pub sco_size_clusters: u32,
    pub region_size_exponent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubReloc {
    pub ca: ClusterAddress,
    pub old_loc: ClusterLocation,
    pub new_loc: ClusterLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubbingResult {
    pub snapshot_name: String,
    pub relocs: Vec<ScrubReloc>,
    pub new_tlog_names: Vec<Uuid>,
    pub new_sco_names: Vec<Sco>,
    pub deleted_scos: Vec<Sco>,
}

pub fn scrubbing_result_object_name(id: Uuid) -> String {
    format!("scrubbing_result{id}")
}

/// Runs the scrub algorithm against TLogs already present in `tlog_dir`
/// (the caller is responsible for having fetched them from the
/// backend). `next_sco_number` seeds numbering for freshly-packed SCOs;
/// `version` is the scrub-incremented version stamped on all of them
///.
pub fn scrub(
    work: &ScrubWorkUnit,
    tlog_dir: &Path,
    next_sco_number: ScoNumber,
    version: u8,
) -> Result<ScrubbingResult> {
    let mut latest: FxHashMap<ClusterAddress, ClusterLocation> = FxHashMap::default();
    let mut source_scos: std::collections::HashSet<Sco> = std::collections::HashSet::new();

    tlog::replay_all(tlog_dir, &work.tlog_ids, |entry| {
        if let novastore_core::types::TlogEntry::Loc { ca, loc, .. } = entry {
            latest.insert(ca, loc);
            source_scos.insert(loc.sco);
        }
        Ok(())
    })?;

    // Stable packing order: by surviving location, so clusters from the
    // same source SCO tend to land contiguously in the new one.
    let mut survivors: Vec<(ClusterAddress, ClusterLocation)> = latest.into_iter().collect();
    survivors.sort_by_key(|(_, loc)| *loc);

    let mut relocs = Vec::with_capacity(survivors.len());
    let mut new_sco_names = Vec::new();
    let mut sco_number = next_sco_number;
    let mut offset_in_current: u32 = work.sco_size_clusters;
    let mut current_sco = Sco::new(sco_number, 0, version);

    for (ca, old_loc) in survivors {
        if offset_in_current == work.sco_size_clusters {
            if new_sco_names.is_empty() {
                current_sco = Sco::new(sco_number, 0, version);
            } else {
                sco_number += 1;
                current_sco = Sco::new(sco_number, 0, version);
            }
            new_sco_names.push(current_sco);
            offset_in_current = 0;
        }
        let new_loc = ClusterLocation::new(current_sco, offset_in_current as u16);
        offset_in_current += 1;
        relocs.push(ScrubReloc { ca, old_loc, new_loc });
    }

    let referenced: std::collections::HashSet<Sco> = relocs.iter().map(|r| r.old_loc.sco).collect();
    let deleted_scos: Vec<Sco> = source_scos.difference(&referenced).copied().collect();

    Ok(ScrubbingResult {
        snapshot_name: work.snapshot_name.clone(),
        relocs,
        new_tlog_names: Vec::new(),
        new_sco_names,
        deleted_scos,
    })
}
