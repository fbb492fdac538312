#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Storage-facing types and collaborator interfaces consumed by the `lattice`
//! scan core, plus an in-memory implementation of the storage traits.

/// Cluster topology view.
pub mod cluster;
/// In-memory storage engine.
pub mod mem;
/// Namespaces, set registry, and scan statistics.
pub mod namespace;
/// Partition trees, cursors, and reservations.
pub mod partition;
/// Predicate-expression evaluation seam.
pub mod predicate;
/// Records, digests, and the record store seam.
pub mod record;
/// Sub-transaction service seam for background scans.
pub mod txn;
/// UDF aggregation runtime seam.
pub mod udf;

pub use cluster::ClusterInfo;
pub use namespace::{Namespace, ScanStats};
pub use partition::{
    IndexCursor, PartitionReservation, PartitionSource, PartitionTree, N_PARTITIONS,
};
pub use predicate::{PredOutcome, Predicate, PredicateCompiler};
pub use record::{Bin, Digest, IndexEntry, RecordRef, RecordStore, DIGEST_LEN};
pub use txn::{OriginKind, SubTransaction, TransactionOrigin, TransactionService, TxnOutcome, WriteFlags};
pub use udf::{AggregationRuntime, AggregationTask, UdfCall, ValueSink};
