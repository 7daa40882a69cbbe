//! In-memory [`Backend`] implementation for tests: a `DashMap`-backed
//! object table instead of a real network client.

use dashmap::DashMap;
use novastore_core::backend::{Backend, OverwriteObject, PartialReadSpec, SeekableRead, WriteCondition};
use novastore_core::error::{Error, Result};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

struct Object {
    bytes: Vec<u8>,
    tag: Option<String>,
}

#[derive(Default)]
pub struct MockBackend {
    namespace: String,
    objects: DashMap<String, Object>,
    fail_connect: AtomicBool,
}

impl MockBackend {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            objects: DashMap::new(),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Test hook: make the next `read`/`partial_read` fail as a
    /// transient connect failure.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn raw_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.get(name).map(|o| o.bytes.clone())
    }
}

impl Backend for MockBackend {
    fn write(
        &self,
        local_path: &Path,
        object_name: &str,
        _overwrite: OverwriteObject,
        _checksum: Option<u32>,
        condition: WriteCondition,
    ) -> Result<()> {
        let bytes = std::fs::read(local_path)?;
        if let WriteCondition::ExpectedTag(expected) = &condition {
            if let Some(existing) = self.objects.get(object_name) {
                if existing.tag.as_deref() != Some(expected.as_str()) {
                    return Err(Error::BackendUniqueObjectTagMismatch {
                        object: object_name.to_string(),
                        expected: expected.clone(),
                        found: existing.tag.clone().unwrap_or_default(),
                    });
                }
            }
        }
        let tag = match &condition {
            WriteCondition::ExpectedTag(t) => Some(t.clone()),
            WriteCondition::None => None,
        };
        self.objects.insert(object_name.to_string(), Object { bytes, tag });
        Ok(())
    }

    fn read(&self, local_path: &Path, object_name: &str, _insist_on_latest: bool) -> Result<()> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(Error::BackendConnectFailure(object_name.to_string()));
        }
        let obj = self
            .objects
            .get(object_name)
            .ok_or_else(|| Error::BackendObjectNotFound(object_name.to_string()))?;
        std::fs::write(local_path, &obj.bytes)?;
        Ok(())
    }

    fn partial_read(
        &self,
        reads: &mut [PartialReadSpec<'_>],
        insist_on_latest: bool,
        fallback: &dyn Fn(&str, &str, bool) -> Result<Box<dyn SeekableRead>>,
    ) -> Result<()> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(Error::BackendConnectFailure("partial_read".to_string()));
        }
        for spec in reads.iter_mut() {
            let mut reader: Box<dyn SeekableRead> = match self.objects.get(&spec.object_name) {
                Some(obj) => Box::new(Cursor::new(obj.bytes.clone())),
                None => fallback(&self.namespace, &spec.object_name, insist_on_latest)?,
            };
            use std::io::{Seek, SeekFrom};
            reader.seek(SeekFrom::Start(spec.offset))?;
            reader.read_exact(spec.buf)?;
        }
        Ok(())
    }

    fn object_exists(&self, object_name: &str) -> Result<bool> {
        Ok(self.objects.contains_key(object_name))
    }

    fn remove(&self, object_name: &str, may_not_exist: bool, _condition: WriteCondition) -> Result<()> {
        if self.objects.remove(object_name).is_none() && !may_not_exist {
            return Err(Error::BackendObjectNotFound(object_name.to_string()));
        }
        Ok(())
    }

    fn get_size(&self, object_name: &str) -> Result<u64> {
        self.objects
            .get(object_name)
            .map(|o| o.bytes.len() as u64)
            .ok_or_else(|| Error::BackendObjectNotFound(object_name.to_string()))
    }

    fn create_namespace(&self, must_not_exist: bool) -> Result<()> {
        if must_not_exist && !self.objects.is_empty() {
            return Err(Error::Backend("namespace already exists".into()));
        }
        Ok(())
    }

    fn delete_namespace(&self) -> Result<()> {
        self.objects.clear();
        Ok(())
    }

    fn namespace_exists(&self) -> Result<bool> {
        Ok(true)
    }

    fn invalidate_cache(&self) {}

    fn namespace(&self) -> &str {
        &self.namespace
    }
}
