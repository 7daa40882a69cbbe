use novastore_core::backend::Backend;
use novastore_core::error::Result;
use novastore_core::tasks::InlineScheduler;
use novastore_core::types::{ClusterLocation, Sco, ScoNumber};
use novastore_datastore::mock_backend::MockBackend;
use novastore_snapshot::snapshot_management::{SnapshotManagement, TlogWrittenObserver};
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

struct NoopObserver;
impl TlogWrittenObserver for NoopObserver {
    fn on_tlog_written(&self, _tlog_id: Uuid, _last_sco_in_tlog: ScoNumber) -> Result<()> {
        Ok(())
    }
}

fn management(dir: &std::path::Path, backend: Arc<MockBackend>) -> SnapshotManagement {
    SnapshotManagement::new_volume(
        dir.to_path_buf(),
        backend,
        Arc::new(InlineScheduler),
        "owner-1".to_string(),
        1000,
        None,
    )
    .unwrap()
}

#[test]
fn create_snapshot_rolls_the_tlog_and_records_it() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("ns"));
    let mgmt = management(dir.path(), backend);

    let first_tlog = mgmt.current_tlog_id();
    mgmt.add_cluster_entry(0, ClusterLocation::new(Sco::own(1), 0), None).unwrap();
    let num = mgmt.create_snapshot("s1", None, vec![], Uuid::new_v4()).unwrap();
    assert_eq!(num, 1);

    let manifest = mgmt.manifest_snapshot();
    let snap = manifest.find("s1").unwrap();
    assert_eq!(snap.tlogs, vec![first_tlog]);
    assert_ne!(mgmt.current_tlog_id(), first_tlog);
}

#[test]
fn duplicate_snapshot_name_is_rejected() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("ns"));
    let mgmt = management(dir.path(), backend);
    mgmt.create_snapshot("s1", None, vec![], Uuid::new_v4()).unwrap();
    let err = mgmt.create_snapshot("s1", None, vec![], Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, novastore_core::error::Error::SnapshotAlreadyExists(_)));
}

#[test]
fn tlog_written_callback_marks_snapshot_durable_and_notifies_observer() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("ns"));
    let mgmt = management(dir.path(), backend.clone());

    let first_tlog = mgmt.current_tlog_id();
    mgmt.create_snapshot("s1", None, vec![], Uuid::new_v4()).unwrap();

    assert!(!mgmt.manifest_snapshot().find("s1").unwrap().in_backend);
    mgmt.tlog_written_to_backend_callback(first_tlog, 1, &NoopObserver).unwrap();
    assert!(mgmt.manifest_snapshot().find("s1").unwrap().in_backend);
    assert!(backend.object_exists("snapshots.xml").unwrap());
}

#[test]
fn restore_snapshot_rejects_a_snapshot_not_yet_in_backend() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("ns"));
    let mgmt = management(dir.path(), backend);
    let num = mgmt.create_snapshot("s1", None, vec![], Uuid::new_v4()).unwrap();
    let err = mgmt.restore_snapshot(num).unwrap_err();
    assert!(matches!(err, novastore_core::error::Error::SnapshotNotInBackend(_)));
}

#[test]
fn restore_snapshot_truncates_manifest_and_reopens_tlog() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(MockBackend::new("ns"));
    let mgmt = management(dir.path(), backend);

    let first_tlog = mgmt.current_tlog_id();
    let num = mgmt.create_snapshot("s1", None, vec![], Uuid::new_v4()).unwrap();
    mgmt.tlog_written_to_backend_callback(first_tlog, 1, &NoopObserver).unwrap();

    let second_tlog = mgmt.current_tlog_id();
    mgmt.create_snapshot("s2", None, vec![], Uuid::new_v4()).unwrap();

    let orphaned = mgmt.restore_snapshot(num).unwrap();
    assert!(orphaned.contains(&second_tlog));
    assert!(mgmt.manifest_snapshot().find("s2").is_none());
    assert_ne!(mgmt.current_tlog_id(), second_tlog);
}
