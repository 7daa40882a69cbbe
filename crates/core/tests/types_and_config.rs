use novastore_core::config::{check_config, ClusterCacheConfig, MetadataBackendConfig, VolumeConfig, VolumeRole};
use novastore_core::types::{ClusterLocation, Sco};

fn base_config() -> VolumeConfig {
    VolumeConfig {
        version: VolumeConfig::CURRENT_VERSION,
        id: "vol-1".into(),
        namespace: "ns-vol-1".into(),
        lba_size: 512,
        lba_count: 1 << 20,
        cluster_multiplier: 8,
        sco_multiplier: 1024,
        tlog_multiplier: None,
        parent: None,
        owner_tag: "node-a".into(),
        cluster_cache: ClusterCacheConfig::default(),
        metadata_backend: MetadataBackendConfig::default(),
        dtl: None,
        role: VolumeRole::Normal,
        is_template: false,
        number_of_syncs_to_ignore: 0,
        maximum_time_to_ignore_syncs_s: 0,
    }
}

#[test]
fn sco_object_name_round_trips() {
    let sco = Sco::new(0xABCDEF, 0x2, 0x1);
    let name = sco.object_name();
    assert_eq!(name, "02_00abcdef_01");
    assert_eq!(Sco::parse(&name), Some(sco));
    assert!(Sco::is_sco_name(&name));
    assert!(!Sco::is_sco_name("snapshots.xml"));
}

#[test]
fn cluster_location_bit_packing_round_trips() {
    let loc = ClusterLocation::new(Sco::new(42, 1, 0), 17);
    let bits = loc.to_bits();
    assert_eq!(ClusterLocation::from_bits(bits), loc);
    assert!(!loc.is_null());
    assert!(ClusterLocation::null().is_null());
}

#[test]
fn valid_config_passes_check() {
    let report = check_config(&base_config());
    assert!(report.is_ok(), "{:?}", report.problems);
}

#[test]
fn bad_lba_size_is_reported() {
    let mut cfg = base_config();
    cfg.lba_size = 513; // not a power of two
    let report = check_config(&cfg);
    assert!(!report.is_ok());
    assert!(report.problems.iter().any(|p| p.field == "lba_size"));
}

#[test]
fn cluster_size_and_count_are_consistent() {
    let cfg = base_config();
    assert_eq!(cfg.cluster_size(), 512 * 8);
    assert_eq!(cfg.cluster_count(), (cfg.lba_count * 512) / cfg.cluster_size() as u64);
}
