use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::cluster::ClusterInfo;
use crate::partition::{
    IndexCursor, PartitionReservation, PartitionSource, PartitionTree, N_PARTITIONS,
};
use crate::record::{Bin, Digest, IndexEntry, RecordRef, RecordStore, DIGEST_LEN};

/// One record held by the in-memory engine.
#[derive(Debug, Clone, Default)]
pub struct MemRecord {
    /// Owning set id, 0 for none.
    pub set_id: u16,
    /// Record generation.
    pub generation: u32,
    /// Expiration, epoch seconds (0 = never).
    pub expiration: u32,
    /// Deletion marker.
    pub tombstone: bool,
    /// Past the expiry grace period.
    pub doomed: bool,
    /// Bin values.
    pub bins: Vec<Bin>,
    /// Makes bin loads fail, for fault-injection in tests.
    pub fail_bins: bool,
}

impl MemRecord {
    /// A live record in `set_id` with the given bins.
    pub fn with_bins(set_id: u16, bins: Vec<Bin>) -> Self {
        Self { set_id, generation: 1, bins, ..Self::default() }
    }
}

struct MemPartition {
    records: RwLock<BTreeMap<Digest, MemRecord>>,
}

struct MemCursor<'a> {
    records: &'a RwLock<BTreeMap<Digest, MemRecord>>,
    start: Option<Digest>,
    last: Option<Digest>,
}

impl IndexCursor for MemCursor<'_> {
    fn next_entry(&mut self) -> Option<IndexEntry> {
        let guard = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut range = match self.last {
            None => guard.range((
                Bound::Included(self.start.unwrap_or(Digest::from_bytes([0; DIGEST_LEN]))),
                Bound::Unbounded,
            )),
            Some(last) => guard.range((Bound::Excluded(last), Bound::Unbounded)),
        };
        let (digest, record) = range.next()?;
        let entry = IndexEntry {
            digest: *digest,
            set_id: record.set_id,
            generation: record.generation,
            expiration: record.expiration,
            tombstone: record.tombstone,
            doomed: record.doomed,
        };
        self.last = Some(*digest);
        Some(entry)
    }
}

impl PartitionTree for MemPartition {
    fn size(&self) -> u64 {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn cursor_from(&self, start: Option<Digest>) -> Box<dyn IndexCursor + '_> {
        Box::new(MemCursor { records: &self.records, start, last: None })
    }
}

struct MemRecordRef {
    entry: IndexEntry,
    bins: Vec<Bin>,
    fail_bins: bool,
}

impl RecordRef for MemRecordRef {
    fn entry(&self) -> &IndexEntry {
        &self.entry
    }

    fn bins(&self, names: Option<&[String]>) -> anyhow::Result<Vec<Bin>> {
        if self.fail_bins {
            anyhow::bail!("device read failed");
        }
        Ok(match names {
            None => self.bins.clone(),
            Some(names) => self
                .bins
                .iter()
                .filter(|bin| names.iter().any(|n| *n == bin.name))
                .cloned()
                .collect(),
        })
    }
}

/// In-memory storage engine: per-partition ordered maps with controllable
/// mastership and a live-reservation counter.
pub struct MemStore {
    partitions: Vec<Arc<MemPartition>>,
    unmastered: RwLock<HashSet<u32>>,
    reservations: Arc<AtomicI64>,
    data_in_memory: bool,
}

impl MemStore {
    /// A store mastering all partitions.
    pub fn new(data_in_memory: bool) -> Self {
        Self {
            partitions: (0..N_PARTITIONS)
                .map(|_| Arc::new(MemPartition { records: RwLock::new(BTreeMap::new()) }))
                .collect(),
            unmastered: RwLock::new(HashSet::new()),
            reservations: Arc::new(AtomicI64::new(0)),
            data_in_memory,
        }
    }

    /// Inserts or replaces a record; the partition comes from the digest.
    pub fn insert(&self, digest: Digest, record: MemRecord) {
        let partition = &self.partitions[digest.partition_id() as usize];
        partition
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest, record);
    }

    /// Removes a record, if present.
    pub fn remove(&self, digest: &Digest) {
        let partition = &self.partitions[digest.partition_id() as usize];
        partition.records.write().unwrap_or_else(PoisonError::into_inner).remove(digest);
    }

    /// Marks `pid` as mastered (or not) by this node.
    pub fn set_mastered(&self, pid: u32, mastered: bool) {
        let mut unmastered = self.unmastered.write().unwrap_or_else(PoisonError::into_inner);
        if mastered {
            unmastered.remove(&pid);
        } else {
            unmastered.insert(pid);
        }
    }

    /// Number of reservations currently outstanding.
    pub fn live_reservations(&self) -> i64 {
        self.reservations.load(Ordering::Acquire)
    }

    /// Index size of `pid`, tombstones included.
    pub fn partition_size(&self, pid: u32) -> u64 {
        self.partitions[pid as usize].size()
    }
}

impl RecordStore for MemStore {
    fn open(&self, digest: &Digest) -> Option<Box<dyn RecordRef + '_>> {
        let partition = &self.partitions[digest.partition_id() as usize];
        let guard = partition.records.read().unwrap_or_else(PoisonError::into_inner);
        let record = guard.get(digest)?;
        Some(Box::new(MemRecordRef {
            entry: IndexEntry {
                digest: *digest,
                set_id: record.set_id,
                generation: record.generation,
                expiration: record.expiration,
                tombstone: record.tombstone,
                doomed: record.doomed,
            },
            bins: record.bins.clone(),
            fail_bins: record.fail_bins,
        }))
    }

    fn data_in_memory(&self) -> bool {
        self.data_in_memory
    }
}

impl PartitionSource for MemStore {
    fn reserve(&self, pid: u32) -> Option<PartitionReservation> {
        if self.unmastered.read().unwrap_or_else(PoisonError::into_inner).contains(&pid) {
            return None;
        }
        let tree = self.partitions[pid as usize].clone();
        self.reservations.fetch_add(1, Ordering::AcqRel);
        let counter = self.reservations.clone();
        Some(PartitionReservation::new(
            pid,
            tree,
            Some(Box::new(move || {
                counter.fetch_sub(1, Ordering::AcqRel);
            })),
        ))
    }
}

/// Settable cluster view for embedding and tests.
pub struct MemCluster {
    key: AtomicU64,
    migrations: AtomicBool,
}

impl MemCluster {
    /// A stable cluster with the given key.
    pub fn new(key: u64) -> Self {
        Self { key: AtomicU64::new(key), migrations: AtomicBool::new(false) }
    }

    /// Changes the cluster key.
    pub fn set_key(&self, key: u64) {
        self.key.store(key, Ordering::Release);
    }

    /// Flags migrations as in progress (or done).
    pub fn set_migrations(&self, in_progress: bool) {
        self.migrations.store(in_progress, Ordering::Release);
    }
}

impl ClusterInfo for MemCluster {
    fn cluster_key(&self) -> u64 {
        self.key.load(Ordering::Acquire)
    }

    fn migrations_in_progress(&self) -> bool {
        self.migrations.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bin(name: &str, value: &'static [u8]) -> Bin {
        Bin { name: name.to_string(), value: Bytes::from_static(value) }
    }

    #[test]
    fn cursor_walks_in_digest_order_and_resumes_inclusively() {
        let store = MemStore::new(true);
        for seed in [3u64, 1, 2] {
            store.insert(Digest::for_partition(5, seed), MemRecord::with_bins(0, Vec::new()));
        }
        let rsv = store.reserve(5).expect("mastered");
        let mut cursor = rsv.tree().cursor_from(None);
        let seeds: Vec<u64> = std::iter::from_fn(|| cursor.next_entry())
            .map(|e| u64::from_be_bytes(e.digest.as_bytes()[2..10].try_into().unwrap()))
            .collect();
        assert_eq!(seeds, vec![1, 2, 3]);

        let mut cursor = rsv.tree().cursor_from(Some(Digest::for_partition(5, 2)));
        assert_eq!(
            cursor.next_entry().map(|e| e.digest),
            Some(Digest::for_partition(5, 2))
        );
    }

    #[test]
    fn reservations_release_on_drop() {
        let store = MemStore::new(true);
        let rsv = store.reserve(9).expect("mastered");
        assert_eq!(store.live_reservations(), 1);
        drop(rsv);
        assert_eq!(store.live_reservations(), 0);

        store.set_mastered(9, false);
        assert!(store.reserve(9).is_none());
        assert_eq!(store.live_reservations(), 0);
    }

    #[test]
    fn bin_faults_are_injected() {
        let store = MemStore::new(true);
        let digest = Digest::for_partition(0, 1);
        let mut record = MemRecord::with_bins(0, vec![bin("a", b"x")]);
        record.fail_bins = true;
        store.insert(digest, record);

        let handle = store.open(&digest).expect("present");
        assert!(handle.bins(None).is_err());
    }

    #[test]
    fn bin_projection_filters_by_name() {
        let store = MemStore::new(true);
        let digest = Digest::for_partition(0, 2);
        store.insert(digest, MemRecord::with_bins(0, vec![bin("a", b"x"), bin("b", b"y")]));

        let handle = store.open(&digest).expect("present");
        let names = vec!["b".to_string()];
        let bins = handle.bins(Some(&names)).unwrap();
        assert_eq!(bins, vec![bin("b", b"y")]);
    }
}
