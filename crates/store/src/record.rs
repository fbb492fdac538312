use std::fmt;

use bytes::Bytes;

pub use lattice_proto::DIGEST_LEN;

use crate::partition::N_PARTITIONS;

/// 20-byte key digest identifying a record within a namespace.
///
/// Ordering is plain byte order, which is also the iteration order of a
/// partition tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a digest from a byte slice of exactly [`DIGEST_LEN`] bytes.
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; DIGEST_LEN] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Partition owning this digest: the first two bytes, little-endian,
    /// masked to the partition count.
    pub fn partition_id(&self) -> u32 {
        (u16::from_le_bytes([self.0[0], self.0[1]]) as u32) & (N_PARTITIONS - 1)
    }

    /// Builds a digest that lands in `pid`, ordered within the partition by
    /// `seed`. Used by tooling and tests to place records deterministically.
    pub fn for_partition(pid: u32, seed: u64) -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[..2].copy_from_slice(&((pid & (N_PARTITIONS - 1)) as u16).to_le_bytes());
        bytes[2..10].copy_from_slice(&seed.to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Index metadata for one record, as yielded by a partition cursor.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// Record digest.
    pub digest: Digest,
    /// Owning set id, 0 when the record belongs to no set.
    pub set_id: u16,
    /// Record generation.
    pub generation: u32,
    /// Expiration, epoch seconds (0 = never).
    pub expiration: u32,
    /// Deletion marker.
    pub tombstone: bool,
    /// Past the expiry grace period; skipped by every scan variant.
    pub doomed: bool,
}

/// A named value within a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bin {
    /// Bin name.
    pub name: String,
    /// Serialized bin value, opaque to the scan core.
    pub value: Bytes,
}

/// An open storage handle on one record. Dropping the handle closes it.
pub trait RecordRef: Send {
    /// Index metadata of the record.
    fn entry(&self) -> &IndexEntry;

    /// Loads the record's bins, optionally projected to `names`.
    fn bins(&self, names: Option<&[String]>) -> anyhow::Result<Vec<Bin>>;
}

/// The record storage engine, as seen by the scan core.
pub trait RecordStore: Send + Sync {
    /// Opens a storage handle on `digest`, or `None` if the record is gone.
    fn open(&self, digest: &Digest) -> Option<Box<dyn RecordRef + '_>>;

    /// True when record data lives entirely in memory; gates the
    /// throttle-after-filter behavior of basic scans.
    fn data_in_memory(&self) -> bool;
}
