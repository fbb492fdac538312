use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use lattice_proto::ResultCode;
use lattice_store::{
    OriginKind, PartitionReservation, PredOutcome, SubTransaction, TransactionOrigin,
    TransactionService, TxnOutcome,
};

use crate::api::{JobKind, JobStat};
use crate::job::{JobCore, JobCounters, PidSpec, ScanJob, SetSelector};

/// Ceiling on in-flight sub-transactions per background job.
pub(crate) const MAX_ACTIVE_TRANSACTIONS: u32 = 200;

/// Backoff while the in-flight ceiling holds.
const ACTIVE_WAIT: Duration = Duration::from_millis(1);

/// Poll interval while finish drains the in-flight count.
const FINISH_WAIT: Duration = Duration::from_micros(100);

/// Builds the completion hook stamped into a background job's transaction
/// origin. It captures only the job's counter cells, so late completions
/// never extend the job's own lifetime.
pub(crate) fn completion_hook(
    counters: Arc<JobCounters>,
    n_active: Arc<AtomicU32>,
) -> impl Fn(TxnOutcome) + Send + Sync + 'static {
    move |outcome| {
        match outcome {
            TxnOutcome::Ok => {
                counters.n_succeeded.fetch_add(1, Ordering::AcqRel);
            }
            // The record vanished after the slice saw it; not an error.
            TxnOutcome::NotFound => {}
            TxnOutcome::FilteredOut => {
                counters.n_filtered_bins.fetch_add(1, Ordering::AcqRel);
            }
            TxnOutcome::Failed => {
                counters.n_failed.fetch_add(1, Ordering::AcqRel);
            }
        }
        n_active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Background scan applying a UDF or an ops list to each record through
/// per-record sub-transactions. Does not stream records; the client was
/// acknowledged and detached at admission.
pub(crate) struct BgScanJob {
    core: JobCore,
    origin: Arc<TransactionOrigin>,
    service: Arc<dyn TransactionService>,
    n_active: Arc<AtomicU32>,
}

impl BgScanJob {
    pub(crate) fn new(
        core: JobCore,
        origin: Arc<TransactionOrigin>,
        service: Arc<dyn TransactionService>,
        n_active: Arc<AtomicU32>,
    ) -> Self {
        Self { core, origin, service, n_active }
    }
}

#[async_trait]
impl ScanJob for BgScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn slice(&self, spec: &PidSpec, rsv: Option<PartitionReservation>) {
        let Some(rsv) = rsv else {
            // No socket to report on; the client observes silence.
            return;
        };
        if self.core.set_selector() == SetSelector::Unresolved {
            return;
        }

        let tree = rsv.tree();
        let mut cursor = tree.cursor_from(spec.start);
        let counters = self.core.counters();
        let stats = self.core.namespace().stats();

        while let Some(entry) = cursor.next_entry() {
            if self.core.is_abandoned() {
                return;
            }
            if entry.tombstone || entry.doomed {
                continue;
            }
            if !self.core.set_selector().admits(entry.set_id) {
                continue;
            }
            if let Some(predicate) = &self.origin.predicate {
                if predicate.eval_meta(&entry) == PredOutcome::False {
                    counters.n_filtered_meta.fetch_add(1, Ordering::AcqRel);
                    match self.core.kind() {
                        JobKind::UdfBackground => {
                            stats.udf_sub_udf_filtered_out.fetch_add(1, Ordering::AcqRel)
                        }
                        _ => stats.ops_sub_write_filtered_out.fetch_add(1, Ordering::AcqRel),
                    };
                    continue;
                }
            }

            // The entry is an owned copy; no index reference is held while
            // waiting or enqueuing.
            while self.n_active.load(Ordering::Acquire) > MAX_ACTIVE_TRANSACTIONS {
                tokio::time::sleep(ACTIVE_WAIT).await;
            }
            let delay = self.core.throttle_delay();
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            self.n_active.fetch_add(1, Ordering::AcqRel);
            let txn = SubTransaction { digest: entry.digest, origin: self.origin.clone() };
            if let Err(err) = self.service.enqueue(txn) {
                self.n_active.fetch_sub(1, Ordering::AcqRel);
                counters.n_failed.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(
                    trid = self.core.trid(),
                    error = %err,
                    "failed to enqueue scan sub-transaction"
                );
                self.core.abandon(ResultCode::Unknown);
                return;
            }
        }
    }

    async fn finish(&self) {
        // All enqueued sub-transactions must complete before the job can
        // retire; their completion hooks feed the final counters.
        while self.n_active.load(Ordering::Acquire) != 0 {
            tokio::time::sleep(FINISH_WAIT).await;
        }

        let code = self.core.abandon_code().unwrap_or(ResultCode::Ok);
        let stats = self.core.namespace().stats();
        match (self.core.kind(), code) {
            (JobKind::UdfBackground, ResultCode::Ok) => {
                stats.scan_udf_bg_complete.fetch_add(1, Ordering::AcqRel)
            }
            (JobKind::UdfBackground, ResultCode::UserAbort) => {
                stats.scan_udf_bg_abort.fetch_add(1, Ordering::AcqRel)
            }
            (JobKind::UdfBackground, _) => stats.scan_udf_bg_error.fetch_add(1, Ordering::AcqRel),
            (_, ResultCode::Ok) => stats.scan_ops_bg_complete.fetch_add(1, Ordering::AcqRel),
            (_, ResultCode::UserAbort) => stats.scan_ops_bg_abort.fetch_add(1, Ordering::AcqRel),
            (_, _) => stats.scan_ops_bg_error.fetch_add(1, Ordering::AcqRel),
        };
    }

    fn info(&self) -> JobStat {
        let jdata = match &self.origin.kind {
            OriginKind::Udf(call) => format!(
                "udf-filename={}:udf-function={}:udf-active={}",
                call.filename,
                call.function,
                self.n_active.load(Ordering::Acquire)
            ),
            OriginKind::Ops(_) => {
                format!("ops-active={}", self.n_active.load(Ordering::Acquire))
            }
        };
        self.core.stat(0, 0, Some(jdata))
    }
}
