pub mod datastore;
pub mod open_sco;
pub mod sco_cache;

#[cfg(any(test, feature = "test-support"))]
pub mod mock_backend;

pub use datastore::{DataStore, FinalizedSco, ReadDesc};
pub use sco_cache::{CacheHandle, MountPoint, MountPointId, ScoCache};
