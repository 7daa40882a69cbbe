//! Append-only TLog file: a sequence of tagged, fixed-layout entries
//! encoded little-endian.
//!
//! Wire layout per entry: `[tag: u8][payload...]`.
//! - `Loc`  (tag 0): `ca: u64, loc: u64 (packed), hash_present: u8, hash: [u8; 32]`
//! - `Crc`  (tag 1): `crc: u32`
//! - `Sync` (tag 2): (no payload)
//! - `SnapshotMarker` (tag 3): `num: u64`

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use novastore_core::error::{Error, Result};
use novastore_core::types::{ClusterLocation, TlogEntry};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const TAG_LOC: u8 = 0;
const TAG_CRC: u8 = 1;
const TAG_SYNC: u8 = 2;
const TAG_SNAPSHOT_MARKER: u8 = 3;

pub fn object_name(id: Uuid) -> String {
    format!("tlog_{id}")
}

pub fn encode_entry(entry: &TlogEntry, mut w: impl Write) -> Result<()> {
    match entry {
        TlogEntry::Loc { ca, loc, hash } => {
            w.write_u8(TAG_LOC)?;
            w.write_u64::<LittleEndian>(*ca)?;
            w.write_u64::<LittleEndian>(loc.to_bits())?;
            match hash {
                Some(h) => {
                    w.write_u8(1)?;
                    w.write_all(h)?;
                }
                None => {
                    w.write_u8(0)?;
                    w.write_all(&[0u8; 32])?;
                }
            }
        }
        TlogEntry::Crc(crc) => {
            w.write_u8(TAG_CRC)?;
            w.write_u32::<LittleEndian>(*crc)?;
        }
        TlogEntry::Sync => {
            w.write_u8(TAG_SYNC)?;
        }
        TlogEntry::SnapshotMarker(num) => {
            w.write_u8(TAG_SNAPSHOT_MARKER)?;
            w.write_u64::<LittleEndian>(*num)?;
        }
    }
    Ok(())
}

/// Reads exactly one entry, or `Ok(None)` at a clean end-of-stream.
pub fn decode_entry(mut r: impl Read) -> Result<Option<TlogEntry>> {
    let tag = match r.read_u8() {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let entry = match tag {
        TAG_LOC => {
            let ca = r.read_u64::<LittleEndian>()?;
            let bits = r.read_u64::<LittleEndian>()?;
            let present = r.read_u8()?;
            let mut raw = [0u8; 32];
            r.read_exact(&mut raw)?;
            let hash = if present == 1 { Some(raw) } else { None };
            TlogEntry::Loc { ca, loc: ClusterLocation::from_bits(bits), hash }
        }
        TAG_CRC => TlogEntry::Crc(r.read_u32::<LittleEndian>()?),
        TAG_SYNC => TlogEntry::Sync,
        TAG_SNAPSHOT_MARKER => TlogEntry::SnapshotMarker(r.read_u64::<LittleEndian>()?),
        other => return Err(Error::Corruption(format!("unknown TLog entry tag {other}"))),
    };
    Ok(Some(entry))
}

/// The currently-open (write-mode) TLog. One entry counter drives
/// rollover at `max_entries`.
pub struct TlogWriter {
    pub id: Uuid,
    path: PathBuf,
    writer: BufWriter<File>,
    entry_count: u64,
    max_entries: u64,
}

impl TlogWriter {
    pub fn create(dir: &Path, id: Uuid, max_entries: u64) -> Result<Self> {
        let path = dir.join(object_name(id));
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        Ok(Self {
            id,
            path,
            writer: BufWriter::new(file),
            entry_count: 0,
            max_entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Appends a `Loc` entry. Returns `true` if the TLog is now full and
    /// must be rolled.
    pub fn add_cluster_entry(&mut self, ca: u64, loc: ClusterLocation, hash: Option<[u8; 32]>) -> Result<bool> {
        encode_entry(&TlogEntry::Loc { ca, loc, hash }, &mut self.writer)?;
        self.entry_count += 1;
        Ok(self.entry_count >= self.max_entries)
    }

    pub fn add_sco_crc(&mut self, crc: u32) -> Result<()> {
        encode_entry(&TlogEntry::Crc(crc), &mut self.writer)
    }

    pub fn add_snapshot_marker(&mut self, num: u64) -> Result<()> {
        encode_entry(&TlogEntry::SnapshotMarker(num), &mut self.writer)
    }

    /// Flushes to disk; optionally records a CRC marker first.
    pub fn sync(&mut self, maybe_sco_crc: Option<u32>) -> Result<()> {
        if let Some(crc) = maybe_sco_crc {
            self.add_sco_crc(crc)?;
        }
        encode_entry(&TlogEntry::Sync, &mut self.writer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Lazy forward reader over one TLog file.
pub struct TlogReader {
    reader: BufReader<File>,
}

impl TlogReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { reader: BufReader::new(File::open(path)?) })
    }

    pub fn next_entry(&mut self) -> Result<Option<TlogEntry>> {
        decode_entry(&mut self.reader)
    }
}

impl Iterator for TlogReader {
    type Item = Result<TlogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(e)) => Some(Ok(e)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Reads every entry in every named TLog, oldest first, across multiple
/// files.
pub fn replay_all(dir: &Path, tlog_ids: &[Uuid], mut visit: impl FnMut(TlogEntry) -> Result<()>) -> Result<()> {
    for id in tlog_ids {
        let path = dir.join(object_name(*id));
        let mut reader = TlogReader::open(&path)?;
        while let Some(entry) = reader.next_entry()? {
            visit(entry)?;
        }
    }
    Ok(())
}

/// Reads a single TLog backward, returning the last `Loc` entry seen —
/// used for "last cluster location" queries on restart.
pub fn last_location(path: &Path) -> Result<Option<(u64, ClusterLocation)>> {
    let mut reader = TlogReader::open(path)?;
    let mut last = None;
    while let Some(entry) = reader.next_entry()? {
        if let TlogEntry::Loc { ca, loc, .. } = entry {
            last = Some((ca, loc));
        }
    }
    Ok(last)
}
