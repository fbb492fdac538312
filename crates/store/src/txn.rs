use std::fmt;
use std::sync::Arc;

use lattice_proto::MsgOp;

use crate::namespace::Namespace;
use crate::predicate::Predicate;
use crate::record::Digest;
use crate::udf::UdfCall;

/// Terminal outcome of one background sub-transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Applied successfully.
    Ok,
    /// Record vanished between the scan slice and execution.
    NotFound,
    /// Rejected by the origin's bin-level predicate.
    FilteredOut,
    /// Any other failure.
    Failed,
}

/// What a background sub-transaction applies to its record.
pub enum OriginKind {
    /// Apply a UDF.
    Udf(UdfCall),
    /// Apply a list of bin operations.
    Ops(Vec<MsgOp>),
}

/// Write-policy flags carried from the originating request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Deletes leave a durable tombstone.
    pub durable_delete: bool,
    /// Writes may only update existing records.
    pub update_only: bool,
    /// Writes replace the record instead of merging bins.
    pub replace_only: bool,
}

/// Per-job template a background scan stamps onto every sub-transaction.
pub struct TransactionOrigin {
    /// Target namespace.
    pub namespace: Arc<Namespace>,
    /// Payload to apply.
    pub kind: OriginKind,
    /// Write-policy flags.
    pub flags: WriteFlags,
    /// Optional bin-level predicate, applied by the executing
    /// sub-transaction (a rejection reports [`TxnOutcome::FilteredOut`]).
    pub predicate: Option<Arc<dyn Predicate>>,
    completion: Box<dyn Fn(TxnOutcome) + Send + Sync>,
}

impl TransactionOrigin {
    /// Builds an origin; `completion` runs once per finished
    /// sub-transaction, possibly on an arbitrary thread.
    pub fn new(
        namespace: Arc<Namespace>,
        kind: OriginKind,
        flags: WriteFlags,
        predicate: Option<Arc<dyn Predicate>>,
        completion: impl Fn(TxnOutcome) + Send + Sync + 'static,
    ) -> Self {
        Self { namespace, kind, flags, predicate, completion: Box::new(completion) }
    }

    /// Reports one sub-transaction outcome back to the owning job.
    pub fn complete(&self, outcome: TxnOutcome) {
        (self.completion)(outcome);
    }
}

impl fmt::Debug for TransactionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            OriginKind::Udf(call) => format!("udf:{}:{}", call.filename, call.function),
            OriginKind::Ops(ops) => format!("ops[{}]", ops.len()),
        };
        f.debug_struct("TransactionOrigin")
            .field("namespace", &self.namespace.name())
            .field("kind", &kind)
            .field("flags", &self.flags)
            .finish()
    }
}

/// An internally generated single-record transaction.
#[derive(Debug)]
pub struct SubTransaction {
    /// Target record digest.
    pub digest: Digest,
    /// Shared origin template; must outlive execution.
    pub origin: Arc<TransactionOrigin>,
}

/// The node's main transaction pipeline, as seen by background scans.
pub trait TransactionService: Send + Sync {
    /// Enqueues `txn` for execution. An enqueue failure abandons the scan;
    /// the origin's completion hook is *not* called for failed enqueues.
    fn enqueue(&self, txn: SubTransaction) -> anyhow::Result<()>;
}
