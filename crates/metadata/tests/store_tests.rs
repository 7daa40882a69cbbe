use novastore_core::backend::{MetadataServerClient, PageWrite};
use novastore_core::error::{Error, Result};
use novastore_core::tasks::InlineScheduler;
use novastore_core::types::{ClusterLocation, ClusterLocationAndHash, Sco, ScrubId};
use novastore_metadata::MetaDataStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct MockMdsNode {
    pages: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    cork: Mutex<Option<Uuid>>,
    scrub_id: Mutex<Option<ScrubId>>,
    fail: AtomicBool,
}

impl MetadataServerClient for MockMdsNode {
    fn open(&self, _namespace: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::MetadataServer("connect refused".into()));
        }
        Ok(())
    }

    fn get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::MetadataServer("unreachable".into()));
        }
        let pages = self.pages.lock();
        Ok(keys.iter().map(|k| pages.get(k).cloned()).collect())
    }

    fn set(&self, writes: &[PageWrite]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::MetadataServer("unreachable".into()));
        }
        let mut pages = self.pages.lock();
        for w in writes {
            pages.insert(w.key.clone(), w.value.clone());
        }
        Ok(())
    }

    fn cork(&self, uuid: Uuid) -> Result<()> {
        *self.cork.lock() = Some(uuid);
        Ok(())
    }

    fn uncork(&self, uuid: Option<Uuid>) -> Result<()> {
        *self.cork.lock() = uuid;
        Ok(())
    }

    fn last_cork(&self) -> Result<Option<Uuid>> {
        Ok(*self.cork.lock())
    }

    fn scrub_id(&self) -> Result<Option<ScrubId>> {
        Ok(self.scrub_id.lock().clone())
    }

    fn set_scrub_id(&self, id: ScrubId) -> Result<()> {
        *self.scrub_id.lock() = Some(id);
        Ok(())
    }

    fn apply_relocations(
        &self,
        _scrub_id: &ScrubId,
        _clone_id: novastore_core::types::CloneId,
        _relocs: &[(novastore_core::types::ClusterAddress, ClusterLocationAndHash)],
    ) -> Result<()> {
        Ok(())
    }

    fn set_master(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn write_then_read_round_trips_through_the_page_cache() {
    let node = Arc::new(MockMdsNode::default());
    let store = MetaDataStore::new("vol-1", vec![node], 16, false, Arc::new(InlineScheduler)).unwrap();

    assert!(store.read_cluster(42).unwrap().is_unwritten());

    let value = ClusterLocationAndHash {
        location: ClusterLocation::new(Sco::own(1), 3),
        hash: None,
    };
    store.write_cluster(42, value).unwrap();
    assert_eq!(store.read_cluster(42).unwrap(), value);
}

#[test]
fn sync_flushes_dirty_pages_and_survives_cache_invalidation() {
    let node = Arc::new(MockMdsNode::default());
    let store = MetaDataStore::new("vol-1", vec![node.clone()], 16, false, Arc::new(InlineScheduler)).unwrap();

    let value = ClusterLocationAndHash {
        location: ClusterLocation::new(Sco::own(2), 0),
        hash: None,
    };
    store.write_cluster(100, value).unwrap();
    store.sync().unwrap();

    assert!(!node.pages.lock().is_empty());

    // Fresh store instance against the same backend node should see the
    // synced value.
    let store2 = MetaDataStore::new("vol-1", vec![node], 16, false, Arc::new(InlineScheduler)).unwrap();
    assert_eq!(store2.read_cluster(100).unwrap(), value);
}

#[test]
fn failing_master_triggers_failover_to_the_next_node() {
    let bad = Arc::new(MockMdsNode::default());
    let good = Arc::new(MockMdsNode::default());
    let store = MetaDataStore::new("vol-1", vec![bad.clone(), good.clone()], 16, false, Arc::new(InlineScheduler)).unwrap();

    bad.fail.store(true, Ordering::SeqCst);
    store.cork(Uuid::new_v4()).unwrap();

    assert!(good.cork.lock().is_some());
}

#[test]
fn every_node_failing_is_reported_as_all_nodes_failed() {
    let bad1 = Arc::new(MockMdsNode::default());
    let bad2 = Arc::new(MockMdsNode::default());
    let store = MetaDataStore::new("vol-1", vec![bad1.clone(), bad2.clone()], 16, false, Arc::new(InlineScheduler)).unwrap();
    bad1.fail.store(true, Ordering::SeqCst);
    bad2.fail.store(true, Ordering::SeqCst);

    let err = store.cork(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, Error::MetadataServerAllNodesFailed));
}

#[test]
fn apply_relocs_rejects_a_stale_scrub_id() {
    let node = Arc::new(MockMdsNode::default());
    let store = MetaDataStore::new("vol-1", vec![node], 16, false, Arc::new(InlineScheduler)).unwrap();

    let stale = ScrubId("not-the-current-one".to_string());
    let err = store.apply_relocs(&stale, 0, &[], ScrubId::initial()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
