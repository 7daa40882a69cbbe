pub mod dtl_bridge;
pub mod locks;
pub mod task_pool;

pub use dtl_bridge::{DtlBridge, DtlState};
pub use locks::{ManagementLock, WriteLock};
pub use task_pool::{BackendTaskPool, TaskHandler, RETRY_BACKOFF_SECONDS};
