#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use lattice_proto::{FieldType, ResponseFrame, ResultCode, ScanMessage};
use lattice_scan::{ClientChannel, JobStat, JobStatus, ScanEnv, ScanManager};
use lattice_store::mem::{MemCluster, MemRecord, MemStore};
use lattice_store::{
    AggregationRuntime, AggregationTask, Bin, Digest, IndexEntry, Namespace, PredOutcome,
    Predicate, PredicateCompiler, RecordRef, SubTransaction, TransactionService, TxnOutcome,
    ValueSink, WriteFlags,
};

/// Node fixture: in-memory storage, settable cluster, recording transaction
/// service, and a scan environment wired over them.
pub struct Node {
    pub store: Arc<MemStore>,
    pub cluster: Arc<MemCluster>,
    pub txns: Arc<TestTxnService>,
    pub ns: Arc<Namespace>,
    pub env: ScanEnv,
}

/// Installs the test log subscriber once; enable output with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn build_node(bg_cap: u32) -> Node {
    init_tracing();
    let store = Arc::new(MemStore::new(true));
    let cluster = Arc::new(MemCluster::new(1));
    let ns = Arc::new(Namespace::new("prod", store.clone(), store.clone(), bg_cap));
    let txns = Arc::new(TestTxnService::default());
    let env = ScanEnv {
        namespaces: HashMap::from([("prod".to_string(), ns.clone())]),
        cluster: cluster.clone(),
        transactions: txns.clone(),
        aggregation: Arc::new(CountingRuntime),
        predicates: None,
        udf_execution_disabled: AtomicBool::new(false),
    };
    Node { store, cluster, txns, ns, env }
}

/// Transaction service that records enqueues and completes each
/// sub-transaction on a detached task.
#[derive(Default)]
pub struct TestTxnService {
    pub enqueued: AtomicU64,
    /// When set, outcomes are derived from the digest seed (see
    /// [`outcome_for_seed`]); otherwise everything completes `Ok`.
    pub mixed_outcomes: AtomicBool,
    pub completion_delay: Mutex<Duration>,
    pub seen_flags: Mutex<Option<WriteFlags>>,
}

pub fn outcome_for_seed(seed: u64) -> TxnOutcome {
    match seed % 10 {
        0 => TxnOutcome::NotFound,
        1 => TxnOutcome::FilteredOut,
        2 => TxnOutcome::Failed,
        _ => TxnOutcome::Ok,
    }
}

impl TransactionService for TestTxnService {
    fn enqueue(&self, txn: SubTransaction) -> anyhow::Result<()> {
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        *self.seen_flags.lock().unwrap() = Some(txn.origin.flags);
        let outcome = if self.mixed_outcomes.load(Ordering::SeqCst) {
            outcome_for_seed(seed_of(&txn.digest))
        } else {
            TxnOutcome::Ok
        };
        let delay = *self.completion_delay.lock().unwrap();
        tokio::spawn(async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            txn.origin.complete(outcome);
        });
        Ok(())
    }
}

/// Aggregation runtime that emits one value per partition: the digest count
/// as a big-endian u64.
pub struct CountingRuntime;

#[async_trait]
impl AggregationRuntime for CountingRuntime {
    async fn aggregate(
        &self,
        task: AggregationTask<'_>,
        out: &mut dyn ValueSink,
    ) -> anyhow::Result<()> {
        out.write(Bytes::from((task.digests.len() as u64).to_be_bytes().to_vec())).await
    }
}

/// Aggregation runtime that always fails.
pub struct FailingRuntime;

#[async_trait]
impl AggregationRuntime for FailingRuntime {
    async fn aggregate(
        &self,
        _task: AggregationTask<'_>,
        _out: &mut dyn ValueSink,
    ) -> anyhow::Result<()> {
        anyhow::bail!("function raised an error")
    }
}

/// Predicate keyed off record generation: 1 fails on metadata, 2 needs the
/// open record (passes only with a bin named "keep"), anything else passes.
pub struct GenPredicate;

impl Predicate for GenPredicate {
    fn eval_meta(&self, entry: &IndexEntry) -> PredOutcome {
        match entry.generation {
            1 => PredOutcome::False,
            2 => PredOutcome::Unknown,
            _ => PredOutcome::True,
        }
    }

    fn eval_record(&self, record: &dyn RecordRef) -> bool {
        record
            .bins(None)
            .map(|bins| bins.iter().any(|bin| bin.name == "keep"))
            .unwrap_or(false)
    }
}

/// Compiler that ignores the raw bytes and hands out a fixed predicate.
pub struct FixedCompiler(pub Arc<dyn Predicate>);

impl PredicateCompiler for FixedCompiler {
    fn compile(&self, _raw: &[u8]) -> anyhow::Result<Arc<dyn Predicate>> {
        Ok(self.0.clone())
    }
}

/// Write sink that rejects every write, simulating a dead client socket.
pub struct FailingStream;

impl tokio::io::AsyncWrite for FailingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A client channel over an in-memory socket, plus a reader task collecting
/// everything the scan streams back. The reader completes once the scan
/// releases the socket.
pub fn channel_pair(compress: bool) -> (ClientChannel, JoinHandle<Vec<u8>>) {
    let (mut client_end, server_end) = tokio::io::duplex(64 * 1024);
    let reader = tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = client_end.read_to_end(&mut out).await;
        out
    });
    (ClientChannel::new(server_end, compress).with_peer("10.0.0.9:3000"), reader)
}

pub fn scan_msg(ns: &str, trid: u64) -> ScanMessage {
    let mut msg = ScanMessage::default();
    msg.set_field(FieldType::Namespace, ns.as_bytes().to_vec());
    msg.set_field(FieldType::Trid, trid.to_be_bytes().to_vec());
    msg
}

pub fn with_pids(msg: &mut ScanMessage, pids: &[u16]) {
    let mut raw = Vec::new();
    for pid in pids {
        raw.extend_from_slice(&pid.to_le_bytes());
    }
    msg.set_field(FieldType::PidArray, raw);
}

pub fn with_rps(msg: &mut ScanMessage, rps: u32) {
    msg.set_field(FieldType::RecsPerSec, rps.to_be_bytes().to_vec());
}

pub fn with_sample_max(msg: &mut ScanMessage, max: u64) {
    msg.set_field(FieldType::SampleMax, max.to_be_bytes().to_vec());
}

/// Scan options: priority nibble, fail-on-cluster-change bit, sample percent.
pub fn with_options(msg: &mut ScanMessage, priority: u8, fail_on_change: bool, pct: u8) {
    let first = (priority << 4) | if fail_on_change { 0x08 } else { 0 };
    msg.set_field(FieldType::ScanOptions, vec![first, pct]);
}

pub fn with_udf(msg: &mut ScanMessage, op: u8) {
    msg.set_field(FieldType::UdfOp, vec![op]);
    msg.set_field(FieldType::UdfFilename, b"analytics".to_vec());
    msg.set_field(FieldType::UdfFunction, b"count".to_vec());
}

/// Inserts `count` live records into `pid`, seeded 0..count, each with one
/// bin "v" holding its seed.
pub fn populate(store: &MemStore, pid: u32, count: u64, set_id: u16) {
    for seed in 0..count {
        store.insert(
            Digest::for_partition(pid, seed),
            MemRecord::with_bins(
                set_id,
                vec![Bin { name: "v".to_string(), value: Bytes::from(seed.to_be_bytes().to_vec()) }],
            ),
        );
    }
}

pub fn seed_of(digest: &Digest) -> u64 {
    u64::from_be_bytes(digest.as_bytes()[2..10].try_into().unwrap())
}

/// Polls the manager until `trid` reports done, then returns its stats.
pub async fn wait_done(manager: &ScanManager, trid: u64) -> JobStat {
    for _ in 0..4000 {
        if let Some(stat) = manager.get_job_info(trid) {
            if stat.status == JobStatus::Done {
                return stat;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("scan job {trid} did not finish");
}

/// Splits a decoded stream into (record/value frames, fin code).
pub fn split_stream(frames: Vec<ResponseFrame>) -> (Vec<ResponseFrame>, ResultCode) {
    let mut fin = None;
    let mut rest = Vec::new();
    for frame in frames {
        match frame {
            ResponseFrame::Fin { result } => fin = Some(result),
            other => rest.push(other),
        }
    }
    (rest, fin.expect("stream carries no fin"))
}

pub fn record_count(frames: &[ResponseFrame]) -> usize {
    frames.iter().filter(|f| matches!(f, ResponseFrame::Record { .. })).count()
}

pub fn partition_done(frames: &[ResponseFrame]) -> Vec<(u32, ResultCode)> {
    frames
        .iter()
        .filter_map(|f| match f {
            ResponseFrame::PartitionDone { result, pid } => Some((*pid, *result)),
            _ => None,
        })
        .collect()
}
