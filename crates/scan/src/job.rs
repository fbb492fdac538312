use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lattice_proto::ResultCode;
use lattice_store::{Digest, Namespace, PartitionReservation, N_PARTITIONS};

use crate::api::{JobKind, JobStat, JobStatus};

/// One requested partition, with an optional resume digest.
#[derive(Debug, Clone)]
pub(crate) struct PidSpec {
    pub(crate) pid: u32,
    pub(crate) start: Option<Digest>,
}

/// Which partitions a job covers.
pub(crate) enum PartitionSelection {
    /// Whole-namespace scan over all partitions; unmastered partitions are
    /// skipped silently.
    All,
    /// Client-enumerated partitions; unmastered partitions get an explicit
    /// per-partition outcome where the variant streams one.
    Explicit(Vec<PidSpec>),
}

impl PartitionSelection {
    pub(crate) fn is_per_partition(&self) -> bool {
        matches!(self, Self::Explicit(_))
    }

    /// Slice dispatch list, one entry per partition to visit.
    pub(crate) fn slice_specs(&self) -> Vec<PidSpec> {
        match self {
            Self::All => (0..N_PARTITIONS).map(|pid| PidSpec { pid, start: None }).collect(),
            Self::Explicit(specs) => specs.clone(),
        }
    }

    /// Partition count used to split an absolute sample budget.
    pub(crate) fn n_requested(&self) -> u64 {
        match self {
            Self::All => N_PARTITIONS as u64,
            Self::Explicit(specs) => specs.len() as u64,
        }
    }
}

/// Set filter applied to every observed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetSelector {
    /// No set filter; the whole namespace qualifies.
    All,
    /// Only records of this set id qualify.
    Id(u16),
    /// The requested set does not exist in the namespace; nothing qualifies.
    Unresolved,
}

impl SetSelector {
    pub(crate) fn admits(&self, set_id: u16) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => *id == set_id,
            Self::Unresolved => false,
        }
    }
}

/// Record counters shared with sub-transaction completion hooks.
#[derive(Debug, Default)]
pub(crate) struct JobCounters {
    pub(crate) n_succeeded: AtomicU64,
    pub(crate) n_failed: AtomicU64,
    pub(crate) n_filtered_meta: AtomicU64,
    pub(crate) n_filtered_bins: AtomicU64,
}

/// Per-job RPS throttle: a shared next-allowed timestamp advanced by one
/// period per counted record, so concurrent slices share one cadence.
pub(crate) struct Throttle {
    period_ns: u64,
    epoch: Instant,
    next_ns: AtomicU64,
}

impl Throttle {
    pub(crate) fn new(rps: u32) -> Self {
        Self {
            period_ns: if rps == 0 { 0 } else { 1_000_000_000 / rps as u64 },
            epoch: Instant::now(),
            next_ns: AtomicU64::new(0),
        }
    }

    /// Registers one record and returns how long the caller must sleep to
    /// hold the job at its target rate. Zero when unthrottled or on pace.
    pub(crate) fn next_delay(&self) -> Duration {
        if self.period_ns == 0 {
            return Duration::ZERO;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        let due = self.next_ns.fetch_add(self.period_ns, Ordering::Relaxed);
        Duration::from_nanos(due.saturating_sub(now))
    }
}

/// Fields and lifecycle shared by all four job variants.
pub(crate) struct JobCore {
    kind: JobKind,
    trid: u64,
    namespace: Arc<Namespace>,
    set_name: String,
    set_sel: SetSelector,
    selection: PartitionSelection,
    rps: u32,
    client: String,
    started_at: DateTime<Utc>,
    epoch: Instant,
    abandoned: AtomicU32,
    counters: Arc<JobCounters>,
    throttle: Throttle,
    remaining_slices: AtomicUsize,
}

impl JobCore {
    pub(crate) fn new(
        kind: JobKind,
        trid: u64,
        namespace: Arc<Namespace>,
        set_name: String,
        set_sel: SetSelector,
        selection: PartitionSelection,
        rps: u32,
        client: String,
    ) -> Self {
        Self {
            kind,
            trid,
            namespace,
            set_name,
            set_sel,
            selection,
            rps,
            client,
            started_at: Utc::now(),
            epoch: Instant::now(),
            abandoned: AtomicU32::new(0),
            counters: Arc::new(JobCounters::default()),
            throttle: Throttle::new(rps),
            remaining_slices: AtomicUsize::new(0),
        }
    }

    pub(crate) fn kind(&self) -> JobKind {
        self.kind
    }

    pub(crate) fn trid(&self) -> u64 {
        self.trid
    }

    pub(crate) fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub(crate) fn set_selector(&self) -> SetSelector {
        self.set_sel
    }

    pub(crate) fn selection(&self) -> &PartitionSelection {
        &self.selection
    }

    pub(crate) fn client(&self) -> &str {
        &self.client
    }

    pub(crate) fn counters(&self) -> &Arc<JobCounters> {
        &self.counters
    }

    /// Marks the job abandoned with `code`; only the first caller wins.
    pub(crate) fn abandon(&self, code: ResultCode) -> bool {
        let won = self
            .abandoned
            .compare_exchange(0, code.as_u8() as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            tracing::info!(
                trid = self.trid,
                kind = self.kind.tag(),
                namespace = self.namespace.name(),
                client = self.client.as_str(),
                reason = code.name(),
                "scan job abandoned"
            );
        }
        won
    }

    pub(crate) fn abandon_code(&self) -> Option<ResultCode> {
        match self.abandoned.load(Ordering::Acquire) {
            0 => None,
            raw => ResultCode::from_u8(raw as u8),
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire) != 0
    }

    pub(crate) fn throttle_delay(&self) -> Duration {
        self.throttle.next_delay()
    }

    pub(crate) fn set_total_slices(&self, n: usize) {
        self.remaining_slices.store(n, Ordering::Release);
    }

    /// Accounts one completed slice; true when it was the last.
    pub(crate) fn slice_done(&self) -> bool {
        self.remaining_slices.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Builds the common part of a monitoring snapshot.
    pub(crate) fn stat(
        &self,
        net_io_bytes: u64,
        socket_timeout_ms: u64,
        jdata: Option<String>,
    ) -> JobStat {
        JobStat {
            trid: self.trid,
            kind: self.kind,
            namespace: self.namespace.name().to_string(),
            set: self.set_name.clone(),
            status: JobStatus::Active,
            result_code: self.abandoned.load(Ordering::Acquire) as u8,
            started_at: self.started_at,
            run_ms: self.epoch.elapsed().as_millis() as u64,
            n_succeeded: self.counters.n_succeeded.load(Ordering::Acquire),
            n_failed: self.counters.n_failed.load(Ordering::Acquire),
            n_filtered_meta: self.counters.n_filtered_meta.load(Ordering::Acquire),
            n_filtered_bins: self.counters.n_filtered_bins.load(Ordering::Acquire),
            net_io_bytes,
            socket_timeout_ms,
            rps: self.rps,
            jdata,
        }
    }
}

/// One scan job variant, dispatched behind a shared handle.
#[async_trait]
pub(crate) trait ScanJob: Send + Sync {
    /// Shared fields.
    fn core(&self) -> &JobCore;

    /// Processes one partition. `rsv` is `None` when this node does not
    /// master the partition.
    async fn slice(&self, spec: &PidSpec, rsv: Option<PartitionReservation>);

    /// Runs once after the last slice: terminal streaming, in-flight drains,
    /// namespace completion counters.
    async fn finish(&self);

    /// Live monitoring snapshot.
    fn info(&self) -> JobStat;
}
