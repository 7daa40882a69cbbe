use dashmap::DashMap;
use novastore_core::backend::{Backend, MetadataServerClient};
use novastore_core::config::{VolumeConfig, VolumeManagerConfig};
use novastore_core::error::{Error, Result};
use novastore_core::events::EventSink;
use novastore_datastore::sco_cache::MountPoint;
use novastore_engine::Volume;
use std::path::PathBuf;
use std::sync::Arc;

/// Owns the node-wide mountpoint pool and admission policy a single
/// host process needs on top of individual [`Volume`]s: every
/// `create_new_volume` call is checked against `volume_potential`
/// before a byte of backend I/O happens.
pub struct VolumeManager {
    config: VolumeManagerConfig,
    mountpoint_template: Vec<MountPoint>,
    event_sink: Arc<dyn EventSink>,
    volumes: DashMap<String, Arc<Volume>>,
}

impl VolumeManager {
    pub fn new(config: VolumeManagerConfig, mountpoints: Vec<MountPoint>, event_sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            mountpoint_template: mountpoints,
            event_sink,
            volumes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &VolumeManagerConfig {
        &self.config
    }

    /// Upper bound on how many more volumes of a given SCO size could be
    /// admitted right now, given the landing-cache headroom already
    /// committed to open volumes. An estimate, not a reservation: two
    /// concurrent callers can both see the same headroom.
    pub fn volume_potential(&self, sco_size_bytes: u64) -> u64 {
        let per_volume = self.config.max_non_disposable_bytes(sco_size_bytes, self.config.default_tlog_multiplier);
        if per_volume == 0 {
            return 0;
        }
        self.headroom_bytes() / per_volume
    }

    fn total_capacity_bytes(&self) -> u64 {
        self.mountpoint_template.iter().map(|m| m.capacity_bytes).sum()
    }

    fn assigned_bytes(&self) -> u64 {
        self.volumes.iter().map(|entry| entry.value().non_disposable_bytes()).sum()
    }

    fn headroom_bytes(&self) -> u64 {
        self.total_capacity_bytes().saturating_sub(self.assigned_bytes())
    }

    fn admit(&self, cfg: &VolumeConfig) -> Result<()> {
        let sco_size_bytes = cfg.cluster_size() as u64 * cfg.sco_size_clusters() as u64;
        let tlog_multiplier = cfg.effective_tlog_multiplier(self.config.default_tlog_multiplier);
        let needed = self.config.max_non_disposable_bytes(sco_size_bytes, tlog_multiplier);
        let headroom = self.headroom_bytes();
        if headroom < needed {
            return Err(Error::InsufficientResources(format!(
                "volume '{}' needs {needed} bytes of landing-cache headroom, {headroom} available across {} mountpoints",
                cfg.namespace,
                self.mountpoint_template.len()
            )));
        }
        Ok(())
    }

    /// Each volume gets its own subdirectory under every shared
    /// mountpoint, quota-limited to that mountpoint's own
    /// `capacity_bytes`/`trigger_gap_bytes` (the manager's admission
    /// check, not the mountpoint struct, is what prevents
    /// over-committing the underlying disk).
    fn mountpoints_for(&self, namespace: &str) -> Vec<MountPoint> {
        self.mountpoint_template
            .iter()
            .map(|m| MountPoint {
                id: m.id,
                path: m.path.join(namespace),
                capacity_bytes: m.capacity_bytes,
                trigger_gap_bytes: m.trigger_gap_bytes,
                used_bytes: 0,
                offline: m.offline,
            })
            .collect()
    }

    pub fn create_new_volume(
        &self,
        dir: PathBuf,
        config: VolumeConfig,
        backend: Arc<dyn Backend>,
        metadata_nodes: Vec<Arc<dyn MetadataServerClient>>,
    ) -> Result<Arc<Volume>> {
        if self.volumes.contains_key(&config.namespace) {
            return Err(Error::InvalidArgument(format!("volume '{}' is already open", config.namespace)));
        }
        self.admit(&config)?;

        let namespace = config.namespace.clone();
        let mountpoints = self.mountpoints_for(&namespace);
        let volume = Volume::create_new(
            dir,
            config,
            backend,
            metadata_nodes,
            mountpoints,
            self.event_sink.clone(),
            self.config.default_tlog_multiplier,
            self.config.default_cluster_cache_limit,
        )?;
        self.volumes.insert(namespace, volume.clone());
        Ok(volume)
    }

    pub fn open_volume(&self, namespace: &str) -> Option<Arc<Volume>> {
        self.volumes.get(namespace).map(|entry| entry.value().clone())
    }

    /// Halts the volume and drops the manager's handle to it. The
    /// caller's own `Arc<Volume>` clones, if any, keep working until
    /// dropped; they'll just observe `is_halted() == true`.
    pub fn close_volume(&self, namespace: &str, reason: &str) -> Result<()> {
        if let Some((_, volume)) = self.volumes.remove(namespace) {
            volume.halt(reason)?;
        }
        Ok(())
    }

    pub fn open_namespaces(&self) -> Vec<String> {
        self.volumes.iter().map(|entry| entry.key().clone()).collect()
    }
}
