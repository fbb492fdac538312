//! Public API types for the scan core.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lattice_proto::{MsgError, ResultCode};
use lattice_store::{
    AggregationRuntime, ClusterInfo, Namespace, PredicateCompiler, TransactionService,
};

/// Configuration for the scan manager.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Number of slice worker tasks consuming the partition work queue.
    pub threads: usize,

    /// Cap on concurrently active jobs, applied per namespace and variant.
    pub active_cap: usize,

    /// Maximum number of terminal job stats retained for monitoring.
    pub finished_cap: usize,
}

impl ScanConfig {
    /// Default worker pool size.
    pub const DEFAULT_THREADS: usize = 4;

    /// Default per-namespace, per-variant active job cap.
    pub const DEFAULT_ACTIVE_CAP: usize = 100;

    /// Default size of the finished-jobs ring.
    pub const DEFAULT_FINISHED_CAP: usize = 100;
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            threads: Self::DEFAULT_THREADS,
            active_cap: Self::DEFAULT_ACTIVE_CAP,
            finished_cap: Self::DEFAULT_FINISHED_CAP,
        }
    }
}

/// Scan job variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Streams record data back to the client.
    #[serde(rename = "basic")]
    Basic,
    /// Streams UDF aggregation values back to the client.
    #[serde(rename = "aggregation")]
    Aggregation,
    /// Applies a UDF to each record via background sub-transactions.
    #[serde(rename = "background-udf")]
    UdfBackground,
    /// Applies bin operations to each record via background sub-transactions.
    #[serde(rename = "background-ops")]
    OpsBackground,
}

impl JobKind {
    /// Monitoring tag for this variant.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Aggregation => "aggregation",
            Self::UdfBackground => "background-udf",
            Self::OpsBackground => "background-ops",
        }
    }
}

/// Whether a job is still running or already terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Registered and eligible for slice dispatch.
    #[serde(rename = "active")]
    Active,
    /// Finished; stats are frozen in the finished ring.
    #[serde(rename = "done")]
    Done,
}

/// Monitoring snapshot of one scan job, active or finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStat {
    /// Job id, unique among active jobs.
    pub trid: u64,
    /// Variant.
    pub kind: JobKind,
    /// Target namespace.
    pub namespace: String,
    /// Target set, empty for whole-namespace jobs.
    pub set: String,
    /// Active or done.
    pub status: JobStatus,
    /// Abandon reason wire value, 0 while running cleanly.
    pub result_code: u8,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    /// Milliseconds since start (frozen at finish for done jobs).
    pub run_ms: u64,
    /// Records delivered or sub-transactions applied successfully.
    pub n_succeeded: u64,
    /// Records that failed to load or apply.
    pub n_failed: u64,
    /// Records rejected by the metadata predicate.
    pub n_filtered_meta: u64,
    /// Records rejected by the bin-level predicate.
    pub n_filtered_bins: u64,
    /// Bytes written to the client socket.
    pub net_io_bytes: u64,
    /// Socket timeout in milliseconds, 0 = infinite or detached.
    pub socket_timeout_ms: u64,
    /// Target records per second, 0 = unthrottled.
    pub rps: u32,
    /// Variant-specific suffix (UDF identity, in-flight counts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jdata: Option<String>,
}

/// Synchronous failure starting a scan, reported back on the originating
/// request path.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Malformed or out-of-range request parameter.
    #[error("invalid scan parameter: {0}")]
    Parameter(&'static str),
    /// Set name unknown in the namespace on a whole-namespace scan.
    #[error("set not found in namespace")]
    NotFound,
    /// UDF execution is administratively disabled.
    #[error("UDF execution disabled")]
    Forbidden,
    /// Feature combination the variant does not support.
    #[error("unsupported scan feature: {0}")]
    Unsupported(&'static str),
    /// Migrations in progress with fail-on-cluster-change requested.
    #[error("cluster key mismatch")]
    ClusterKeyMismatch,
    /// Per-namespace active job cap reached for the variant.
    #[error("scan job limit reached")]
    JobLimit,
    /// The scan manager has shut down.
    #[error("scan manager stopped")]
    Shutdown,
    /// Field decoding failed.
    #[error(transparent)]
    Msg(#[from] MsgError),
}

impl ScanError {
    /// Wire result code reported to the client.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::Parameter(_) | Self::Msg(_) => ResultCode::Parameter,
            Self::NotFound => ResultCode::NotFound,
            Self::Forbidden => ResultCode::Forbidden,
            Self::Unsupported(_) => ResultCode::UnsupportedFeature,
            Self::ClusterKeyMismatch => ResultCode::ClusterKeyMismatch,
            Self::JobLimit => ResultCode::JobLimit,
            Self::Shutdown => ResultCode::Unknown,
        }
    }
}

/// Node-level collaborators and switches consumed by the scan core.
pub struct ScanEnv {
    /// Namespaces by name.
    pub namespaces: HashMap<String, Arc<Namespace>>,
    /// Cluster topology view.
    pub cluster: Arc<dyn ClusterInfo>,
    /// Sub-transaction pipeline for background scans.
    pub transactions: Arc<dyn TransactionService>,
    /// UDF aggregation runtime.
    pub aggregation: Arc<dyn AggregationRuntime>,
    /// Predicate compiler; requests carrying a predicate are rejected when
    /// absent.
    pub predicates: Option<Arc<dyn PredicateCompiler>>,
    /// Process-wide switch disabling UDF and aggregation scans.
    pub udf_execution_disabled: AtomicBool,
}

impl ScanEnv {
    /// Looks up a namespace by name.
    pub fn namespace(&self, name: &str) -> Option<&Arc<Namespace>> {
        self.namespaces.get(name)
    }
}
