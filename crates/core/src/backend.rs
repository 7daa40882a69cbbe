//! Trait surfaces the core consumes from external collaborators: the backend object store, the DTL server, and the metadata
//! server. Implementations live outside this crate (a real client
//! library, or a `Mock*` used by tests in the consuming crates).

use crate::error::Result;
use crate::types::Sco;
use std::io::{Read, Seek};

/// A single entry in a [`Backend::partial_read`] batch.
pub struct PartialReadSpec<'a> {
    pub object_name: String,
    pub offset: u64,
    pub size: u64,
    pub buf: &'a mut [u8],
}

/// Tag used for conditional writes, guarding against split-brain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    None,
    /// Write only if the object's current tag equals this value (or the
    /// object does not exist yet).
    ExpectedTag(String),
}

pub enum OverwriteObject {
    T,
    F,
}

/// A readable/seekable handle to backend object content, returned by the
/// `partial_read` fallback path.
pub trait SeekableRead: Read + Seek + Send {}
impl<T: Read + Seek + Send> SeekableRead for T {}

/// The backend object store client. One instance per volume
/// namespace; `clone_with_new_namespace` produces a handle scoped to an
/// ancestor's namespace for clone-chain reads.
pub trait Backend: Send + Sync {
    fn write(
        &self,
        local_path: &std::path::Path,
        object_name: &str,
        overwrite: OverwriteObject,
        checksum: Option<u32>,
        condition: WriteCondition,
    ) -> Result<()>;

    fn read(&self, local_path: &std::path::Path, object_name: &str, insist_on_latest: bool) -> Result<()>;

    /// On a miss for any entry, `fallback` is invoked with
    /// `(namespace, object_name, insist_on_latest)` and must return a
    /// seekable reader over the object's bytes; the fallback owns
    /// populating any local cache.
    fn partial_read(
        &self,
        reads: &mut [PartialReadSpec<'_>],
        insist_on_latest: bool,
        fallback: &dyn Fn(&str, &str, bool) -> Result<Box<dyn SeekableRead>>,
    ) -> Result<()>;

    fn object_exists(&self, object_name: &str) -> Result<bool>;
    fn remove(&self, object_name: &str, may_not_exist: bool, condition: WriteCondition) -> Result<()>;
    fn get_size(&self, object_name: &str) -> Result<u64>;
    fn create_namespace(&self, must_not_exist: bool) -> Result<()>;
    fn delete_namespace(&self) -> Result<()>;
    fn namespace_exists(&self) -> Result<bool>;
    fn invalidate_cache(&self);
    fn namespace(&self) -> &str;
}

/// One record replicated to the DTL / replayed from it on recovery.
#[derive(Debug, Clone)]
pub struct DtlRecord {
    pub loc: crate::types::ClusterLocation,
    pub lba: u64,
    pub payload: Vec<u8>,
}

pub trait DtlClient: Send + Sync {
    fn add_entries(&self, records: &[DtlRecord]) -> Result<bool>;
    fn flush(&self) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn remove_up_to(&self, sco: Sco) -> Result<()>;
    fn get_sco_range(&self) -> Result<Option<(Sco, Sco)>>;
    fn get_sco_from_failover(&self, sco: Sco, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;
    fn set_request_timeout(&self, secs: u64);
    fn delete_failover_dir(&self) -> Result<()>;
    fn replay(&self, callback: &mut dyn FnMut(DtlRecord) -> Result<()>) -> Result<()>;
}

/// A page-granularity write destined for the metadata server.
pub struct PageWrite {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub trait MetadataServerClient: Send + Sync {
    fn open(&self, namespace: &str) -> Result<()>;
    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;
    fn set(&self, writes: &[PageWrite]) -> Result<()>;
    fn cork(&self, uuid: uuid::Uuid) -> Result<()>;
    fn uncork(&self, uuid: Option<uuid::Uuid>) -> Result<()>;
    fn last_cork(&self) -> Result<Option<uuid::Uuid>>;
    fn scrub_id(&self) -> Result<Option<crate::types::ScrubId>>;
    fn set_scrub_id(&self, id: crate::types::ScrubId) -> Result<()>;
    fn apply_relocations(
        &self,
        scrub_id: &crate::types::ScrubId,
        clone_id: crate::types::CloneId,
        relocs: &[(crate::types::ClusterAddress, crate::types::ClusterLocationAndHash)],
    ) -> Result<()>;
    fn set_master(&self) -> Result<()>;
}
