pub mod apply_scrub;
pub mod manifest;
pub mod scrubber;
pub mod snapshot_management;
pub mod tlog;

pub use manifest::SnapshotPersistor;
pub use scrubber::{scrub, ScrubReloc, ScrubWorkUnit, ScrubbingResult};
pub use snapshot_management::{SnapshotManagement, TlogWrittenObserver};
