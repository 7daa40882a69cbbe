pub mod cluster_cache;
pub mod volume;

pub use cluster_cache::{CacheKey, ClusterCache};
pub use volume::Volume;
