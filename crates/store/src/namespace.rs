use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, PoisonError, RwLock};

use crate::partition::{PartitionReservation, PartitionSource};
use crate::record::{Digest, RecordRef, RecordStore};

/// Per-namespace scan statistics. All counters are cumulative since start.
#[derive(Debug, Default)]
pub struct ScanStats {
    /// Basic scans finished cleanly.
    pub scan_basic_complete: AtomicU64,
    /// Basic scans cancelled by a user abort.
    pub scan_basic_abort: AtomicU64,
    /// Basic scans abandoned for any other reason.
    pub scan_basic_error: AtomicU64,
    /// Aggregation scans finished cleanly.
    pub scan_aggr_complete: AtomicU64,
    /// Aggregation scans cancelled by a user abort.
    pub scan_aggr_abort: AtomicU64,
    /// Aggregation scans abandoned for any other reason.
    pub scan_aggr_error: AtomicU64,
    /// Background UDF scans finished cleanly.
    pub scan_udf_bg_complete: AtomicU64,
    /// Background UDF scans cancelled by a user abort.
    pub scan_udf_bg_abort: AtomicU64,
    /// Background UDF scans abandoned for any other reason.
    pub scan_udf_bg_error: AtomicU64,
    /// Background ops scans finished cleanly.
    pub scan_ops_bg_complete: AtomicU64,
    /// Background ops scans cancelled by a user abort.
    pub scan_ops_bg_abort: AtomicU64,
    /// Background ops scans abandoned for any other reason.
    pub scan_ops_bg_error: AtomicU64,
    /// Records rejected by the metadata predicate of background UDF scans.
    pub udf_sub_udf_filtered_out: AtomicU64,
    /// Records rejected by the metadata predicate of background ops scans.
    pub ops_sub_write_filtered_out: AtomicU64,
}

struct SetRegistry {
    by_name: HashMap<String, u16>,
    names: Vec<String>,
}

/// A namespace: a named key space divided into partitions, holding sets.
///
/// The scan core owns the namespace object (its statistics and scan-facing
/// configuration); record storage and partition reservations are delegated
/// to the node's storage engine.
pub struct Namespace {
    name: String,
    background_scan_max_rps: u32,
    store: Arc<dyn RecordStore>,
    partitions: Arc<dyn PartitionSource>,
    sets: RwLock<SetRegistry>,
    stats: ScanStats,
}

impl Namespace {
    /// Builds a namespace over the given storage engine.
    ///
    /// `background_scan_max_rps` caps (and defaults) the RPS of background
    /// scans; 0 leaves them unlimited.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RecordStore>,
        partitions: Arc<dyn PartitionSource>,
        background_scan_max_rps: u32,
    ) -> Self {
        Self {
            name: name.into(),
            background_scan_max_rps,
            store,
            partitions,
            sets: RwLock::new(SetRegistry { by_name: HashMap::new(), names: Vec::new() }),
            stats: ScanStats::default(),
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// RPS cap for background scans (0 = unlimited).
    pub fn background_scan_max_rps(&self) -> u32 {
        self.background_scan_max_rps
    }

    /// True when record data lives entirely in memory.
    pub fn data_in_memory(&self) -> bool {
        self.store.data_in_memory()
    }

    /// Opens a storage handle on `digest`.
    pub fn open_record(&self, digest: &Digest) -> Option<Box<dyn RecordRef + '_>> {
        self.store.open(digest)
    }

    /// Reserves partition `pid`, or `None` when this node does not master it.
    pub fn reserve(&self, pid: u32) -> Option<PartitionReservation> {
        self.partitions.reserve(pid)
    }

    /// Registers `set`, returning its id. Idempotent.
    pub fn register_set(&self, set: &str) -> u16 {
        let mut registry = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = registry.by_name.get(set) {
            return *id;
        }
        registry.names.push(set.to_string());
        let id = registry.names.len() as u16;
        registry.by_name.insert(set.to_string(), id);
        id
    }

    /// Resolves `set` to its id, or `None` when unknown in this namespace.
    pub fn set_id(&self, set: &str) -> Option<u16> {
        let registry = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        registry.by_name.get(set).copied()
    }

    /// Resolves a set id back to its name. Id 0 ("no set") yields `None`.
    pub fn set_name(&self, id: u16) -> Option<String> {
        if id == 0 {
            return None;
        }
        let registry = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        registry.names.get(id as usize - 1).cloned()
    }

    /// Scan statistics.
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }
}
