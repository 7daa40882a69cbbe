//! `MetaDataStore`: a crash-consistent `CA -> ClusterLocationAndHash`
//! index backed by one or more metadata-server replicas, with
//! corking for epoch-aligned durability and scrub-result application.

use crate::page_cache::{page_of, Page, PageCache, PageId, PAGE_ENTRIES};
use novastore_core::backend::MetadataServerClient;
use novastore_core::error::{Error, Result};
use novastore_core::tasks::{Task, TaskScheduler};
use novastore_core::types::{ClusterAddress, ClusterLocationAndHash, CloneId, ScrubId};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

fn page_key(id: PageId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn encode_page(page: &Page) -> Vec<u8> {
    let mut buf = Vec::with_capacity(page.entries.len() * 17);
    for entry in &page.entries {
        buf.extend_from_slice(&entry.location.to_bits().to_be_bytes());
        match entry.hash {
            Some(h) => {
                buf.push(1);
                buf.extend_from_slice(&h);
            }
            None => buf.push(0),
        }
    }
    buf
}

fn decode_page(bytes: &[u8]) -> Result<Page> {
    let mut entries = Vec::with_capacity(PAGE_ENTRIES as usize);
    let mut pos = 0usize;
    while entries.len() < PAGE_ENTRIES as usize {
        if pos + 9 > bytes.len() {
            return Err(Error::Corruption("truncated metadata page".to_string()));
        }
        let loc_bits = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap());
        let location = novastore_core::types::ClusterLocation::from_bits(loc_bits);
        let has_hash = bytes[pos + 8];
        pos += 9;
        let hash = if has_hash == 1 {
            if pos + 32 > bytes.len() {
                return Err(Error::Corruption("truncated metadata page hash".to_string()));
            }
            let mut h = [0u8; 32];
            h.copy_from_slice(&bytes[pos..pos + 32]);
            pos += 32;
            Some(h)
        } else {
            None
        };
        entries.push(ClusterLocationAndHash { location, hash });
    }
    Ok(Page { entries, dirty: false })
}

struct Inner {
    nodes: Vec<Arc<dyn MetadataServerClient>>,
    cache: PageCache,
    last_cork: Option<Uuid>,
    scrub_id: ScrubId,
}

/// Owns an ordered list of metadata-server replicas (node 0 is master),
/// a page cache in front of them, and the failover state machine that
/// promotes the next node when the current master errors out.
pub struct MetaDataStore {
    namespace: String,
    inner: RwLock<Inner>,
    /// Serializes the single failover attempt; other callers wait here
    /// then retry against whatever node ended up as master.
    failover_lock: Mutex<()>,
    apply_relocations_to_slaves: bool,
    scheduler: Arc<dyn TaskScheduler>,
}

impl MetaDataStore {
    pub fn new(
        namespace: &str,
        nodes: Vec<Arc<dyn MetadataServerClient>>,
        cache_capacity_pages: usize,
        apply_relocations_to_slaves: bool,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::InvalidArgument("MetaDataStore requires at least one node".to_string()));
        }
        nodes[0].open(namespace)?;
        Ok(Self {
            namespace: namespace.to_string(),
            inner: RwLock::new(Inner {
                nodes,
                cache: PageCache::new(cache_capacity_pages),
                last_cork: None,
                scrub_id: ScrubId::initial(),
            }),
            failover_lock: Mutex::new(()),
            apply_relocations_to_slaves,
            scheduler,
        })
    }

    /// Hot-swaps the replica list wholesale, opening the new master
    /// before committing and invalidating the page cache since cached
    /// pages may no longer reflect what the new nodes hold.
    pub fn set_nodes(&self, nodes: Vec<Arc<dyn MetadataServerClient>>) -> Result<()> {
        if nodes.is_empty() {
            return Err(Error::InvalidArgument("MetaDataStore requires at least one node".to_string()));
        }
        nodes[0].open(&self.namespace)?;
        let mut inner = self.inner.write();
        inner.nodes = nodes;
        inner.cache.invalidate_all();
        Ok(())
    }

    fn master(&self) -> Arc<dyn MetadataServerClient> {
        self.inner.read().nodes[0].clone()
    }

    /// Runs `f` against the current master; on any error, attempts
    /// failover exactly once (other racing callers block on the lock
    /// and then retry against the new master) before giving up.
    fn with_master_retrying<T>(&self, f: impl Fn(&dyn MetadataServerClient) -> Result<T>) -> Result<T> {
        loop {
            let master = self.master();
            match f(master.as_ref()) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(error = %e, "metadata RPC failed, attempting failover");
                    self.failover()?;
                    // Loop and retry against whatever is master now. If
                    // failover itself exhausted every node it returns
                    // Err, which propagates out of the `?` above.
                }
            }
        }
    }

    fn failover(&self) -> Result<()> {
        let _guard = self.failover_lock.lock();
        let mut inner = self.inner.write();
        let attempted = inner.nodes.len();
        for _ in 0..attempted {
            let failed = inner.nodes.remove(0);
            inner.nodes.push(failed);
            let candidate = inner.nodes[0].clone();
            match candidate.open(&self.namespace) {
                Ok(()) => {
                    info!("metadata failover: promoted next node to master");
                    inner.cache.invalidate_all();
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "candidate metadata node also failed");
                }
            }
        }
        Err(Error::MetadataServerAllNodesFailed)
    }

    pub fn read_cluster(&self, ca: ClusterAddress) -> Result<ClusterLocationAndHash> {
        let mut inner = self.inner.write();
        let id = page_of(ca);
        let nodes = inner.nodes.clone();
        let page = inner.cache.get_or_load(id, || load_page(&nodes, id))?;
        Ok(page.get(ca))
    }

    pub fn write_cluster(&self, ca: ClusterAddress, value: ClusterLocationAndHash) -> Result<()> {
        let mut inner = self.inner.write();
        let id = page_of(ca);
        let nodes = inner.nodes.clone();
        let page = inner.cache.get_or_load(id, || load_page(&nodes, id))?;
        page.set(ca, value);
        Ok(())
    }

    /// Marks the start of a new durability epoch, aligned with a TLog
    /// rollover.
    pub fn cork(&self, uuid: Uuid) -> Result<()> {
        self.with_master_retrying(|m| m.cork(uuid))?;
        self.inner.write().last_cork = Some(uuid);
        Ok(())
    }

    /// Declares everything up to and including `uuid` durable; dirty
    /// pages from that epoch may now be dropped after a flush.
    pub fn uncork(&self, uuid: Option<Uuid>) -> Result<()> {
        self.with_master_retrying(|m| m.uncork(uuid))?;
        self.sync()?;
        self.inner.write().last_cork = uuid;
        Ok(())
    }

    pub fn last_cork(&self) -> Result<Option<Uuid>> {
        Ok(self.inner.read().last_cork)
    }

    pub fn scrub_id(&self) -> Result<Option<ScrubId>> {
        Ok(Some(self.inner.read().scrub_id.clone()))
    }

    pub fn set_scrub_id(&self, id: ScrubId) -> Result<()> {
        self.inner.write().scrub_id = id;
        Ok(())
    }

    /// Flushes every dirty page to the master replica.
    pub fn sync(&self) -> Result<()> {
        let writes = {
            let inner = self.inner.read();
            inner
                .cache
                .dirty_pages()
                .map(|(id, page)| (*id, encode_page(page)))
                .collect::<Vec<_>>()
        };
        if writes.is_empty() {
            return Ok(());
        }
        let page_writes: Vec<novastore_core::backend::PageWrite> = writes
            .iter()
            .map(|(id, bytes)| novastore_core::backend::PageWrite {
                key: page_key(*id),
                value: bytes.clone(),
            })
            .collect();
        self.with_master_retrying(|m| m.set(&page_writes))?;
        let mut inner = self.inner.write();
        for (id, _) in &writes {
            inner.cache.mark_clean(*id);
        }
        Ok(())
    }

    /// Idempotent application of scrub-emitted relocations, gated on the
    /// active scrub id matching `expected_scrub_id`.
    pub fn apply_relocs(
        &self,
        expected_scrub_id: &ScrubId,
        clone_id: CloneId,
        relocations: &[(ClusterAddress, ClusterLocationAndHash)],
        new_scrub_id: ScrubId,
    ) -> Result<()> {
        let current = self.inner.read().scrub_id.clone();
        if current != *expected_scrub_id {
            return Err(Error::InvalidArgument(format!(
                "scrub id mismatch: store has {:?}, caller expected {:?}",
                current, expected_scrub_id
            )));
        }
        self.with_master_retrying(|m| m.apply_relocations(expected_scrub_id, clone_id, relocations))?;
        for (ca, value) in relocations {
            self.write_cluster(*ca, *value)?;
        }
        self.sync()?;
        self.set_scrub_id(new_scrub_id)?;
        self.fan_out_to_slaves(expected_scrub_id.clone(), clone_id, relocations.to_vec());
        Ok(())
    }

    /// Best-effort application of the same relocations to slave replicas,
    /// queued as fire-and-forget tasks followed by a barrier so the pool
    /// won't reorder unrelated work ahead of the fan-out completing.
    fn fan_out_to_slaves(&self, scrub_id: ScrubId, clone_id: CloneId, relocations: Vec<(ClusterAddress, ClusterLocationAndHash)>) {
        if !self.apply_relocations_to_slaves {
            return;
        }
        let slaves: Vec<Arc<dyn MetadataServerClient>> = self.inner.read().nodes.iter().skip(1).cloned().collect();
        if slaves.is_empty() {
            return;
        }
        for slave in slaves {
            let scrub_id = scrub_id.clone();
            let relocations = relocations.clone();
            self.scheduler.schedule(Task::Fun(Arc::new(move || {
                if let Err(e) = slave.apply_relocations(&scrub_id, clone_id, &relocations) {
                    warn!(error = %e, "best-effort relocation application to slave failed");
                }
                Ok(())
            })));
        }
        self.scheduler.schedule(Task::Barrier);
    }

    /// Rebuilds the mapping by replaying TLogs along the clone chain,
    /// oldest ancestor first, up to `end_cork`. Used for backend
    /// restart, snapshot restore, and clone initialization.
    pub fn process_clone_tlogs(
        &self,
        clone_chain_tlogs: &[(novastore_core::types::CloneId, Vec<Uuid>)],
        tlog_dir: &std::path::Path,
        sync: bool,
        end_cork: Option<Uuid>,
    ) -> Result<()> {
        for (clone_id, tlog_ids) in clone_chain_tlogs {
            novastore_snapshot::tlog::replay_all(tlog_dir, tlog_ids, |entry| {
                if let novastore_core::types::TlogEntry::Loc { ca, loc, hash } = entry {
                    let mut loc = loc;
                    loc.sco.clone_id = *clone_id;
                    self.write_cluster(ca, ClusterLocationAndHash { location: loc, hash })?;
                }
                Ok(())
            })?;
        }
        if sync {
            self.sync()?;
        }
        self.inner.write().last_cork = end_cork;
        Ok(())
    }
}

fn load_page(nodes: &[Arc<dyn MetadataServerClient>], id: PageId) -> Result<Option<Page>> {
    let bytes = nodes[0].get(&[page_key(id)])?;
    match bytes.into_iter().next().flatten() {
        Some(b) => decode_page(&b).map(Some),
        None => Ok(None),
    }
}
