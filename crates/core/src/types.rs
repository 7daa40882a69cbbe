//! Data model: [`ClusterAddress`], [`ClusterLocation`], [`Sco`], TLog entry
//! types, and the snapshot manifest shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical cluster index within a volume (`lba / cluster_multiplier`).
pub type ClusterAddress = u64;

/// SCO number: strictly monotonic per volume namespace.
pub type ScoNumber = u32;

/// `clone_id == 0` means "own namespace"; non-zero refers to an ancestor
/// volume in the clone chain.
pub type CloneId = u8;

/// Increments only on scrub-created SCOs.
pub type ScoVersion = u8;

/// Offset of a cluster within a SCO, in cluster units.
pub type ScoOffset = u16;

pub type SnapshotNum = u64;
pub type TlogCounter = u64;

/// Identity of a Storage Container Object: the unit of backend I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sco {
    pub clone_id: CloneId,
    pub number: ScoNumber,
    pub version: ScoVersion,
}

impl Sco {
    pub const fn new(number: ScoNumber, clone_id: CloneId, version: ScoVersion) -> Self {
        Self {
            clone_id,
            number,
            version,
        }
    }

    pub const fn own(number: ScoNumber) -> Self {
        Self::new(number, 0, 0)
    }

    /// `XX_XXXXXXXX_XX`: two hex bytes (clone id), underscore, eight hex
    /// nibbles (number), underscore, two hex bytes (version).
    pub fn object_name(&self) -> String {
        format!("{:02x}_{:08x}_{:02x}", self.clone_id, self.number, self.version)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('_');
        let clone_id = u8::from_str_radix(parts.next()?, 16).ok()?;
        let number = u32::from_str_radix(parts.next()?, 16).ok()?;
        let version = u8::from_str_radix(parts.next()?, 16).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(number, clone_id, version))
    }

    pub fn is_sco_name(s: &str) -> bool {
        Self::parse(s).is_some()
    }

    pub fn incremented(&self, by: ScoNumber) -> Self {
        Self::new(self.number.wrapping_add(by), self.clone_id, self.version)
    }
}

impl fmt::Display for Sco {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.object_name())
    }
}

impl Ord for Sco {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.number, self.version, self.clone_id).cmp(&(other.number, other.version, other.clone_id))
    }
}

impl PartialOrd for Sco {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A packed `{clone_id, number, version, offset}` quad resolving a
/// [`ClusterAddress`] to an offset within a [`Sco`]. A zero-valued
/// location means "never written" (the volume's initial unwritten state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterLocation {
    pub sco: Sco,
    pub offset: ScoOffset,
}

impl ClusterLocation {
    pub const fn new(sco: Sco, offset: ScoOffset) -> Self {
        Self { sco, offset }
    }

    pub const fn null() -> Self {
        Self {
            sco: Sco::new(0, 0, 0),
            offset: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.sco.number == 0 && self.sco.clone_id == 0 && self.sco.version == 0 && self.offset == 0
    }

    /// Pack into the 48-bit wire representation: 8 bits clone_id, 32 bits
    /// number, 8 bits version, 16 bits offset (64 bits total on the wire,
    /// top 16 reserved/zero — kept byte-aligned for cheap encode/decode
    /// rather than truly bit-packed into 48 bits).
    pub fn to_bits(&self) -> u64 {
        (self.sco.clone_id as u64) << 56
            | (self.sco.number as u64) << 24
            | (self.sco.version as u64) << 16
            | self.offset as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        let clone_id = (bits >> 56) as u8;
        let number = (bits >> 24) as u32;
        let version = (bits >> 16) as u8;
        let offset = bits as u16;
        Self {
            sco: Sco::new(number, clone_id, version),
            offset,
        }
    }
}

impl Ord for ClusterLocation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sco.cmp(&other.sco).then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for ClusterLocation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Content hash of a cluster's payload, used in `ContentBased` cache mode.
/// `None` in `LocationBased` mode.
pub type ClusterHash = Option<[u8; 32]>;

/// A `ClusterLocation` paired with the content hash recorded alongside it
/// in the TLog and the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLocationAndHash {
    pub location: ClusterLocation,
    pub hash: ClusterHash,
}

impl ClusterLocationAndHash {
    pub const fn unwritten() -> Self {
        Self {
            location: ClusterLocation::null(),
            hash: None,
        }
    }

    pub fn is_unwritten(&self) -> bool {
        self.location.is_null()
    }
}

/// Tagged entries making up a TLog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TlogEntry {
    Loc {
        ca: ClusterAddress,
        loc: ClusterLocation,
        hash: ClusterHash,
    },
    Crc(u32),
    Sync,
    SnapshotMarker(SnapshotNum),
}

/// A named, numbered cut through the TLog sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub num: SnapshotNum,
    /// Cork UUID: the metadata-store durability epoch this snapshot
    /// closes.
    pub uuid: uuid::Uuid,
    pub parent: Option<SnapshotNum>,
    pub metadata: Vec<u8>,
    pub backend_size: u64,
    pub scrubbed: bool,
    pub in_backend: bool,
    /// TLog ids (in order) that belong to this snapshot.
    pub tlogs: Vec<uuid::Uuid>,
    /// Set once deletion has been requested; the TLog/SCO garbage is
    /// reclaimed by the scrubber.
    pub deleted: bool,
}

/// Reference to a parent volume for clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub namespace: String,
    pub snapshot: SnapshotNum,
}

/// Opaque token that rotates monotonically whenever scrub results are
/// applied. Equality between the metadata store's and manifest's token
/// is a system invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubId(pub String);

impl ScrubId {
    pub fn initial() -> Self {
        Self(uuid::Uuid::nil().to_string())
    }

    pub fn next(&self) -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
