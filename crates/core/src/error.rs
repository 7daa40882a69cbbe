//! Error types for the novastore volume engine.
//!
//! Every subsystem boundary (DataStore, SnapshotManagement, MetaDataStore,
//! the DTL bridge, the scrubber) returns [`Result`]. Backend- or
//! replica-specific errors are converted into one of three [`ErrorKind`]s
//! at the point where they cross into the core

use thiserror::Error;

/// Result type alias used throughout the volume engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`], used by callers to decide whether to
/// retry, wait for internal recovery, or propagate a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller may retry after a delay; no subsystem state was corrupted.
    /// Examples: SCO cache out of space, backend connect failure mid read.
    Transient,
    /// The subsystem handles this internally (mountpoint offlining, MDS
    /// failover) and the caller should simply retry against the (possibly
    /// new) master/mountpoint.
    LocallyRecoverable,
    /// Unrecoverable: the volume must halt.
    Fatal,
}

/// Unified error type for the volume engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("SCO cache has no mountpoint with free space")]
    ScoCacheFull,

    #[error("backend connect failure: {0}")]
    BackendConnectFailure(String),

    #[error("backend object not found: {0}")]
    BackendObjectNotFound(String),

    #[error("backend unique-object tag mismatch for {object}: expected {expected}, found {found}")]
    BackendUniqueObjectTagMismatch {
        object: String,
        expected: String,
        found: String,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("metadata server error: {0}")]
    MetadataServer(String),

    #[error("all metadata-server nodes failed over")]
    MetadataServerAllNodesFailed,

    #[error("DTL is degraded: {0}")]
    DtlDegraded(String),

    #[error("DTL replay produced an impossible offset for {0:?}")]
    DtlImpossibleOffset(crate::types::Sco),

    #[error("snapshot '{0}' already exists")]
    SnapshotAlreadyExists(String),

    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("snapshot '{0}' is not yet durable in the backend")]
    SnapshotNotInBackend(String),

    #[error("scrub id mismatch: expected {expected:?}, found {found:?}")]
    ScrubIdMismatch {
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("volume is halted")]
    Halted,

    #[error("resize would shrink the volume ({current} -> {requested} clusters)")]
    ShrinkNotAllowed { current: u64, requested: u64 },

    #[error("insufficient resources to open a new volume: {0}")]
    InsufficientResources(String),

    #[error("configuration is invalid: {0:?}")]
    InvalidConfig(Vec<String>),

    #[error("TLog rollover failed: {0}")]
    TlogRolloverFailed(String),

    #[error("volume '{0}' is a template and is immutable")]
    TemplateImmutable(String),

    #[error("cluster location references clone id {0} with no registered ancestor backend")]
    UnknownCloneAncestor(crate::types::CloneId),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ScoCacheFull => ErrorKind::Transient,
            Error::BackendConnectFailure(_) => ErrorKind::Transient,
            Error::MetadataServer(_) => ErrorKind::LocallyRecoverable,
            Error::Io(_) => ErrorKind::LocallyRecoverable,
            Error::BackendUniqueObjectTagMismatch { .. }
            | Error::MetadataServerAllNodesFailed
            | Error::DtlImpossibleOffset(_)
            | Error::TlogRolloverFailed(_)
            | Error::Corruption(_)
            | Error::Halted
            | Error::InsufficientResources(_)
            | Error::InvalidConfig(_)
            | Error::TemplateImmutable(_)
            | Error::UnknownCloneAncestor(_) => ErrorKind::Fatal,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    pub fn is_locally_recoverable(&self) -> bool {
        self.kind() == ErrorKind::LocallyRecoverable
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
