use novastore_core::types::{ClusterLocation, Sco};
use novastore_datastore::datastore::{DataStore, ReadDesc};
use novastore_datastore::sco_cache::MountPoint;
use tempfile::tempdir;

const CLUSTER_SIZE: u32 = 4096;

fn mountpoints(dir: &std::path::Path) -> Vec<MountPoint> {
    vec![MountPoint {
        id: 0,
        path: dir.to_path_buf(),
        capacity_bytes: 64 * 1024 * 1024,
        trigger_gap_bytes: 0,
        used_bytes: 0,
        offline: false,
    }]
}

#[test]
fn write_then_read_round_trips_within_open_sco() {
    let dir = tempdir().unwrap();
    let mut store = DataStore::new(dir.path().to_path_buf(), CLUSTER_SIZE, 4, mountpoints(dir.path()));
    store.new_volume().unwrap();

    let payload = vec![0xABu8; CLUSTER_SIZE as usize * 2];
    let (locs, finalized) = store.write_clusters(&payload, 2).unwrap();
    assert_eq!(locs.len(), 2);
    assert!(finalized.is_none());

    let mut buf_a = vec![0u8; CLUSTER_SIZE as usize];
    let mut buf_b = vec![0u8; CLUSTER_SIZE as usize];
    {
        let mut descs = [
            ReadDesc { loc: locs[0], ca: 0, buf: &mut buf_a },
            ReadDesc { loc: locs[1], ca: 1, buf: &mut buf_b },
        ];
        store.read_clusters(&mut descs, None, None).unwrap();
    }
    assert_eq!(buf_a, payload[..CLUSTER_SIZE as usize]);
    assert_eq!(buf_b, payload[CLUSTER_SIZE as usize..]);
    assert_eq!(store.cache_hits(), 2);
}

#[test]
fn rollover_produces_finalized_sco_and_starts_fresh_one() {
    let dir = tempdir().unwrap();
    // sco_multiplier 2 clusters per SCO.
    let mut store = DataStore::new(dir.path().to_path_buf(), CLUSTER_SIZE, 2, mountpoints(dir.path()));
    store.new_volume().unwrap();

    let payload = vec![0x11u8; CLUSTER_SIZE as usize * 2];
    let (locs, finalized) = store.write_clusters(&payload, 2).unwrap();
    assert_eq!(locs[0].sco, locs[1].sco);
    let finalized = finalized.expect("second cluster should have filled the SCO");
    assert_eq!(finalized.sco, Sco::own(1));

    // The store should have rolled onto a fresh SCO for subsequent writes.
    let more = vec![0x22u8; CLUSTER_SIZE as usize];
    let (more_locs, _) = store.write_clusters(&more, 1).unwrap();
    assert_eq!(more_locs[0].sco, Sco::own(2));
}

#[test]
fn null_location_reads_back_zeros() {
    let dir = tempdir().unwrap();
    let mut store = DataStore::new(dir.path().to_path_buf(), CLUSTER_SIZE, 4, mountpoints(dir.path()));
    store.new_volume().unwrap();

    let mut buf = vec![0xFFu8; CLUSTER_SIZE as usize];
    {
        let mut descs = [ReadDesc { loc: ClusterLocation::null(), ca: 0, buf: &mut buf }];
        store.read_clusters(&mut descs, None, None).unwrap();
    }
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn mark_disposable_allows_eviction_on_remove() {
    let dir = tempdir().unwrap();
    let mut store = DataStore::new(dir.path().to_path_buf(), CLUSTER_SIZE, 2, mountpoints(dir.path()));
    store.new_volume().unwrap();

    let payload = vec![0x33u8; CLUSTER_SIZE as usize * 2];
    let (_, finalized) = store.write_clusters(&payload, 2).unwrap();
    let sco = finalized.unwrap().sco;

    // Still non-disposable: a non-forced remove must refuse.
    assert!(!store.remove_sco(sco, false));
    store.mark_disposable(sco);
    assert!(store.remove_sco(sco, false));
}

#[test]
fn backend_restart_drops_scos_past_the_backend_high_water_mark() {
    let dir = tempdir().unwrap();
    let mut store = DataStore::new(dir.path().to_path_buf(), CLUSTER_SIZE, 2, mountpoints(dir.path()));
    store.new_volume().unwrap();

    let payload = vec![0x44u8; CLUSTER_SIZE as usize * 2];
    let (_, finalized) = store.write_clusters(&payload, 2).unwrap();
    let first_sco = finalized.unwrap().sco;
    store.mark_disposable(first_sco);

    let more = vec![0x55u8; CLUSTER_SIZE as usize];
    store.write_clusters(&more, 1).unwrap();

    store.backend_restart(first_sco.number).unwrap();
    assert_eq!(store.latest_sco_in_backend(), first_sco.number);
    // The in-progress second SCO (never reached the backend) is dropped;
    // numbering resumes right after the backend's high-water mark.
    assert_eq!(store.current_sco_number(), first_sco.number + 1);
}
