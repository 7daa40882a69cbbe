//! The currently-open (write-mode) SCO: a local file plus an incremental
//! checksum that gets recorded in the TLog on SCO rollover.

use novastore_core::error::Result;
use novastore_core::types::{ClusterLocation, Sco};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct OpenSco {
    pub sco: Sco,
    path: PathBuf,
    writer: BufWriter<File>,
    checksum: crc32fast::Hasher,
    bytes_written: u64,
    capacity_bytes: u64,
}

impl OpenSco {
    pub fn create(dir: &Path, sco: Sco, capacity_bytes: u64) -> Result<Self> {
        let path = dir.join(sco.object_name());
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            sco,
            path,
            writer: BufWriter::new(file),
            checksum: crc32fast::Hasher::new(),
            bytes_written: 0,
            capacity_bytes,
        })
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.bytes_written)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `payload` at the current offset and returns the
    /// [`ClusterLocation`] it was written to.
    pub fn append_cluster(&mut self, payload: &[u8], cluster_size: u32) -> Result<ClusterLocation> {
        debug_assert_eq!(payload.len() as u32, cluster_size);
        let offset = (self.bytes_written / cluster_size as u64) as u16;
        self.writer.write_all(payload)?;
        self.checksum.update(payload);
        self.bytes_written += payload.len() as u64;
        Ok(ClusterLocation::new(self.sco, offset))
    }

    /// Forced placement for DTL replay: `write_cluster_to_location` must
    /// target the current offset.
    pub fn write_at_current_offset(&mut self, payload: &[u8], loc: ClusterLocation, cluster_size: u32) -> Result<()> {
        debug_assert_eq!(loc.sco, self.sco);
        let expected_offset = (self.bytes_written / cluster_size as u64) as u16;
        debug_assert_eq!(loc.offset, expected_offset);
        self.writer.write_all(payload)?;
        self.checksum.update(payload);
        self.bytes_written += payload.len() as u64;
        Ok(())
    }

    /// Flushes the file descriptor and returns the rolling checksum so
    /// far, for the TLog `Crc` entry on `sync()`.
    pub fn sync(&mut self) -> Result<u32> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(self.checksum.clone().finalize())
    }

    /// Finalizes the SCO: flushes and returns the checksum. Idempotent
    /// when empty: returns `None`.
    pub fn finalize(mut self) -> Result<Option<u32>> {
        if self.bytes_written == 0 {
            return Ok(None);
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(Some(self.checksum.finalize()))
    }

    /// Truncates the backing file to `new_len` bytes, used by
    /// `local_restart` to recover a partially-written SCO up to the last
    /// location known to have been acknowledged.
    pub fn truncate_to(&mut self, new_len: u64) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(new_len)?;
        self.writer.get_ref().seek(SeekFrom::Start(new_len))?;
        self.bytes_written = new_len;
        Ok(())
    }

    /// Reads back a single cluster from the currently-open SCO.
    pub fn read_cluster(&self, offset: u16, cluster_size: u32, buf: &mut [u8]) -> Result<()> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset as u64 * cluster_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }
}
