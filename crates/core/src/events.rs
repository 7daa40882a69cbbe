//! Process-wide error-event publication.

use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdErrorEvent {
    PutScoToBackend,
    PutTlogToBackend,
    PutSnapshotsToBackend,
    GetScoFromBackend,
    GetScoFromFoc,
    MetaDataStore,
    MdsFailover,
    ReadFromDisposableSco,
    ReadFromNonDisposableSco,
    WriteToSco,
    ApplyScrubbingToSnapshotManager,
    ApplyScrubbingRelocs,
    GetScrubbingResultsFromBackend,
    VolumeHalted,
    DiskSpace,
    DtlDegraded,
    DtlRecovered,
}

/// Sink receiving error/lifecycle events. The default [`TracingEventSink`]
/// just logs; a process entry point may install a channel-backed sink to
/// feed an operator-facing alerting system.
pub trait EventSink: Send + Sync {
    fn publish(&self, namespace: &str, event: VdErrorEvent, detail: &str);
}

pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, namespace: &str, event: VdErrorEvent, detail: &str) {
        tracing::warn!(namespace, ?event, detail, "volume event");
    }
}

/// In-memory sink used by tests to assert on emitted events.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, VdErrorEvent, String)>>,
}

impl RecordingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, VdErrorEvent, String)> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, namespace: &str, event: VdErrorEvent, detail: &str) {
        self.events
            .lock()
            .unwrap()
            .push((namespace.to_string(), event, detail.to_string()));
    }
}
