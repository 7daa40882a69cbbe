//! Online application of a [`ScrubbingResult`] to a live volume. Downloading/deserializing the result
//! and locating the matching snapshot number is the caller's job
//! (typically `engine::Volume`); this module does the transactional
//! part: swap the TLog set, apply relocations under the same scrub id,
//! and schedule deletion of what the scrub made garbage.

use crate::scrubber::ScrubbingResult;
use crate::snapshot_management::SnapshotManagement;
use novastore_core::backend::MetadataServerClient;
use novastore_core::error::{Error, Result};
use novastore_core::tasks::{Task, TaskScheduler};
use novastore_core::types::{ClusterLocationAndHash, CloneId, SnapshotNum};

/// Applies `result` to `snapshot_num`. Idempotent: a stale `new_scrub_id`
/// (one the metadata server has already moved past) is rejected by
/// `MetadataServerClient::apply_relocations`, so a retried or
/// double-delivered apply is a no-op rather than a double-application.
pub fn apply_scrubbing_work(
    snapshot_management: &SnapshotManagement,
    metadata: &dyn MetadataServerClient,
    scheduler: &dyn TaskScheduler,
    clone_id: CloneId,
    snapshot_num: SnapshotNum,
    result: ScrubbingResult,
) -> Result<()> {
    let manifest = snapshot_management.manifest_snapshot();
    let snapshot = manifest
        .by_num(snapshot_num)
        .ok_or_else(|| Error::SnapshotNotFound(snapshot_num.to_string()))?;

    let tlogs_in: Vec<_> = snapshot.tlogs.clone();
    let new_scrub_id = snapshot_management.replace_tlogs_with_scrubbed(
        &tlogs_in,
        result.new_tlog_names.clone(),
        snapshot_num,
    )?;

    let relocs: Vec<_> = result
        .relocs
        .iter()
        .map(|r| {
            (
                r.ca,
                ClusterLocationAndHash {
                    location: r.new_loc,
                    hash: None,
                },
            )
        })
        .collect();
    metadata.apply_relocations(&new_scrub_id, clone_id, &relocs)?;

    for sco in &result.deleted_scos {
        scheduler.schedule(Task::DeleteSco { sco: *sco });
    }
    for tlog_id in &tlogs_in {
        scheduler.schedule(Task::DeleteTlog { tlog_id: *tlog_id });
    }

    Ok(())
}
