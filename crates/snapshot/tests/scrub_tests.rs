use novastore_core::types::{ClusterLocation, Sco};
use novastore_snapshot::scrubber::{scrub, ScrubWorkUnit};
use novastore_snapshot::tlog::TlogWriter;
use tempfile::tempdir;
use uuid::Uuid;

#[test]
fn scrub_keeps_only_the_latest_location_per_cluster_address() {
    let dir = tempdir().unwrap();
    let id = Uuid::new_v4();
    let mut writer = TlogWriter::create(dir.path(), id, 1000).unwrap();

    // CA 0 written twice: the first write is garbage after the second.
    let stale = ClusterLocation::new(Sco::own(1), 0);
    let fresh = ClusterLocation::new(Sco::own(1), 1);
    writer.add_cluster_entry(0, stale, None).unwrap();
    writer.add_cluster_entry(0, fresh, None).unwrap();
    writer.add_cluster_entry(1, ClusterLocation::new(Sco::own(1), 2), None).unwrap();
    writer.sync(None).unwrap();
    writer.close().unwrap();

    let work = ScrubWorkUnit {
        namespace: "ns".into(),
        snapshot_name: "s1".into(),
        tlog_ids: vec![id],
        sco_size_clusters: 1024,
        region_size_exponent: 0,
    };
    let result = scrub(&work, dir.path(), 2, 1).unwrap();

    assert_eq!(result.relocs.len(), 2);
    let ca0 = result.relocs.iter().find(|r| r.ca == 0).unwrap();
    assert_eq!(ca0.old_loc, fresh);
    assert!(result.new_sco_names.iter().all(|s| s.version == 1));
    assert!(result.deleted_scos.is_empty(), "source SCO 1 is still referenced by a survivor");
}

#[test]
fn scrub_marks_fully_garbage_scos_for_deletion() {
    let dir = tempdir().unwrap();
    let id = Uuid::new_v4();
    let mut writer = TlogWriter::create(dir.path(), id, 1000).unwrap();

    // SCO 1 is written, then every cluster it held is overwritten into SCO 2.
    writer.add_cluster_entry(0, ClusterLocation::new(Sco::own(1), 0), None).unwrap();
    writer.add_cluster_entry(0, ClusterLocation::new(Sco::own(2), 0), None).unwrap();
    writer.sync(None).unwrap();
    writer.close().unwrap();

    let work = ScrubWorkUnit {
        namespace: "ns".into(),
        snapshot_name: "s1".into(),
        tlog_ids: vec![id],
        sco_size_clusters: 1024,
        region_size_exponent: 0,
    };
    let result = scrub(&work, dir.path(), 3, 1).unwrap();
    assert_eq!(result.deleted_scos, vec![Sco::own(1)]);
}
