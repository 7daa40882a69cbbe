//! The closed task vocabulary posted to a volume's backend worker pool:
//! tagged variants rather than a virtual task hierarchy. The pool
//! itself lives in `concurrency`; this crate only defines what a task
//! *is* so `snapshot` and `metadata` can schedule work without
//! depending on the pool's implementation.

use crate::types::{Sco, ScoNumber};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A unit of backend I/O work. `Fun` is the one variant that boxes a
/// closure, because an arbitrary caller-supplied side effect can't be
/// expressed as a plain tag.
pub enum Task {
    WriteSco { sco: Sco, local_path: std::path::PathBuf, checksum: u32 },
    WriteTlog { tlog_id: Uuid, local_path: std::path::PathBuf },
    WriteSnapshot { local_path: std::path::PathBuf, expected_tag: Option<String> },
    DeleteSco { sco: Sco },
    DeleteTlog { tlog_id: Uuid },
    BlockDeleteScos { up_to: ScoNumber },
    BlockDeleteTlogs { tlog_ids: Vec<Uuid> },
    /// Flushes the queue before running and prevents later tasks from
    /// being reordered ahead of it.
    Barrier,
    /// A boxed side effect too irregular to express as a plain tag.
    /// `Fn` rather than `FnOnce` so the pool's retry path can re-run it
    /// directly from the queued reference instead of having to
    /// reconstruct a consumed closure.
    Fun(Arc<dyn Fn() -> crate::Result<()> + Send + Sync>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::WriteSco { sco, .. } => write!(f, "WriteSco({sco})"),
            Task::WriteTlog { tlog_id, .. } => write!(f, "WriteTlog({tlog_id})"),
            Task::WriteSnapshot { .. } => write!(f, "WriteSnapshot"),
            Task::DeleteSco { sco } => write!(f, "DeleteSco({sco})"),
            Task::DeleteTlog { tlog_id } => write!(f, "DeleteTlog({tlog_id})"),
            Task::BlockDeleteScos { up_to } => write!(f, "BlockDeleteScos(<={up_to})"),
            Task::BlockDeleteTlogs { tlog_ids } => write!(f, "BlockDeleteTlogs({})", tlog_ids.len()),
            Task::Barrier => write!(f, "Barrier"),
            Task::Fun(_) => write!(f, "Fun"),
        }
    }
}

impl Task {
    /// Barrier tasks flush the queue before running; non-barrier tasks
    /// may only be reordered forward, never across a barrier.
    pub fn is_barrier(&self) -> bool {
        matches!(self, Task::Barrier)
    }
}

/// What `snapshot`/`metadata` need from the backend worker pool, kept
/// here so neither depends on `concurrency`'s thread-pool internals.
pub trait TaskScheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

/// Discards upload/delete tasks and runs `Fun` closures inline. Used by
/// tests that exercise the manifest/TLog bookkeeping without a real
/// backend worker pool; assertions about what actually reached the
/// backend should go through a direct call, not a scheduled task.
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn schedule(&self, task: Task) {
        if let Task::Fun(f) = task {
            let _ = f();
        }
    }
}
