//! # novastore
//!
//! A log-structured, network-attached block-storage volume engine:
//! LBA-addressed virtual volumes backed by an object store, with a
//! local SCO landing cache, a TLog write-ahead log, a CA→location
//! metadata index, an optional DTL replication bridge, and an offline
//! scrubber for space reclamation.
//!
//! # Quick start
//!
//! ```no_run
//! use novastore::{VolumeManager, VolumeManagerConfig};
//! use novastore_core::config::VolumeConfig;
//! use std::sync::Arc;
//!
//! # fn backend() -> Arc<dyn novastore::Backend> { unimplemented!() }
//! # fn metadata_nodes() -> Vec<Arc<dyn novastore::MetadataServerClient>> { unimplemented!() }
//! # fn mountpoints() -> Vec<novastore::MountPoint> { unimplemented!() }
//! # fn volume_config() -> VolumeConfig { unimplemented!() }
//! fn main() -> novastore::Result<()> {
//!     let manager = VolumeManager::new(
//!         VolumeManagerConfig::default(),
//!         mountpoints(),
//!         Arc::new(novastore::TracingEventSink),
//!     );
//!     let volume = manager.create_new_volume(
//!         "/var/lib/novastore/vol0".into(),
//!         volume_config(),
//!         backend(),
//!         metadata_nodes(),
//!     )?;
//!     let mut buf = vec![0u8; 512];
//!     volume.write(0, &buf)?;
//!     volume.read(0, &mut buf)?;
//!     Ok(())
//! }
//! ```
//!
//! Internal crates (`datastore`, `concurrency`, `metadata`, `snapshot`,
//! `engine`) are not re-exported wholesale; only the facade and the
//! trait objects a host process needs to plug in its own backend, DTL,
//! and metadata server clients are public here.

pub use novastore_api::VolumeManager;
pub use novastore_core::backend::{Backend, DtlClient, MetadataServerClient};
pub use novastore_core::config::{VolumeConfig, VolumeManagerConfig};
pub use novastore_core::error::{Error, Result};
pub use novastore_core::events::{EventSink, RecordingEventSink, TracingEventSink};
pub use novastore_datastore::sco_cache::MountPoint;
pub use novastore_engine::Volume;
