use std::fmt;
use std::sync::Arc;

use crate::record::{Digest, IndexEntry};

/// Number of hash partitions a namespace's key space is divided into.
pub const N_PARTITIONS: u32 = 4096;

/// Digest-ordered iteration over one partition's index.
///
/// Cursors yield owned entries and hold no locks between steps; record-lock
/// discipline is internal to the tree implementation.
pub trait IndexCursor: Send {
    /// Next entry in digest order, or `None` at the end of the partition.
    fn next_entry(&mut self) -> Option<IndexEntry>;
}

/// One partition's index tree.
pub trait PartitionTree: Send + Sync {
    /// Number of index entries, tombstones included.
    fn size(&self) -> u64;

    /// Cursor starting at `start` (inclusive), or at the first digest.
    fn cursor_from(&self, start: Option<Digest>) -> Box<dyn IndexCursor + '_>;
}

/// Short-lived claim on a partition's tree root against concurrent
/// migrations. Released on drop.
pub struct PartitionReservation {
    pid: u32,
    tree: Arc<dyn PartitionTree>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl PartitionReservation {
    /// Builds a reservation over `tree`; `on_release` runs exactly once when
    /// the reservation drops.
    pub fn new(
        pid: u32,
        tree: Arc<dyn PartitionTree>,
        on_release: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { pid, tree, on_release }
    }

    /// Reserved partition id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The reserved partition's tree.
    pub fn tree(&self) -> &dyn PartitionTree {
        self.tree.as_ref()
    }
}

impl Drop for PartitionReservation {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl fmt::Debug for PartitionReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionReservation").field("pid", &self.pid).finish()
    }
}

/// The partition-reservation subsystem, as seen by the scan core.
pub trait PartitionSource: Send + Sync {
    /// Reserves `pid` for reading, or `None` when this node does not master
    /// the partition.
    fn reserve(&self, pid: u32) -> Option<PartitionReservation>;
}
