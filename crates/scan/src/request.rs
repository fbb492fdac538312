use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_proto::{
    FieldType, Info1, Info2, Info3, OpType, ResultCode, ScanMessage, DIGEST_LEN, MAX_SET_NAME_LEN,
};
use lattice_store::{
    Digest, Namespace, OriginKind, Predicate, TransactionOrigin, UdfCall, WriteFlags, N_PARTITIONS,
};

use crate::aggr::AggrScanJob;
use crate::api::{JobKind, ScanEnv, ScanError};
use crate::background::{completion_hook, BgScanJob};
use crate::basic::BasicScanJob;
use crate::conn::{ClientChannel, ClientConn};
use crate::job::{JobCore, PartitionSelection, PidSpec, SetSelector};
use crate::manager::ScanManager;

/// RPS substituted for old clients that conveyed "slow scan" via priority 1.
const LEGACY_PRIORITY_RPS: u32 = 5000;

const MAX_UDF_FILENAME_LEN: usize = 128;
const MAX_UDF_FUNCTION_LEN: usize = 64;

/// Trid source for requests that carry none.
static NEXT_TRID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanType {
    Basic,
    Aggr,
    UdfBg,
    OpsBg,
}

fn infer_scan_type(msg: &ScanMessage) -> Result<ScanType, ScanError> {
    if msg.field(FieldType::UdfOp).is_none() {
        return Ok(if msg.info2.contains(Info2::WRITE) { ScanType::OpsBg } else { ScanType::Basic });
    }
    match msg.u8_field(FieldType::UdfOp)? {
        Some(1) => Ok(ScanType::Aggr),
        Some(2) => Ok(ScanType::UdfBg),
        _ => Err(ScanError::Parameter("unknown UDF scan operation")),
    }
}

struct CommonParams {
    namespace: Arc<Namespace>,
    set_name: String,
    set_sel: SetSelector,
    selection: PartitionSelection,
    rps: u32,
    sample_pct: u8,
    sample_max: u64,
    fail_on_cluster_change: bool,
    socket_timeout: Option<Duration>,
    trid: u64,
}

fn parse_common(env: &ScanEnv, msg: &ScanMessage) -> Result<CommonParams, ScanError> {
    let ns_name = msg
        .str_field(FieldType::Namespace)?
        .ok_or(ScanError::Parameter("missing namespace"))?;
    let namespace =
        env.namespace(ns_name).cloned().ok_or(ScanError::Parameter("unknown namespace"))?;

    let set_name = match msg.field(FieldType::Set) {
        None => String::new(),
        Some(raw) => {
            if raw.len() > MAX_SET_NAME_LEN {
                return Err(ScanError::Parameter("set name too long"));
            }
            msg.str_field(FieldType::Set)?.unwrap_or("").to_string()
        }
    };
    let set_sel = if set_name.is_empty() {
        SetSelector::All
    } else {
        match namespace.set_id(&set_name) {
            Some(id) => SetSelector::Id(id),
            None => SetSelector::Unresolved,
        }
    };

    let mut fail_on_cluster_change = false;
    let mut priority = 0u8;
    let mut sample_pct = 100u8;
    if let Some(raw) = msg.field(FieldType::ScanOptions) {
        if raw.len() != 2 {
            return Err(ScanError::Parameter("bad scan options"));
        }
        fail_on_cluster_change = raw[0] & 0x08 != 0;
        priority = raw[0] >> 4;
        sample_pct = raw[1];
        if sample_pct == 0 || sample_pct > 100 {
            return Err(ScanError::Parameter("sample percent out of range"));
        }
    }

    let mut requested = vec![false; N_PARTITIONS as usize];
    let mut specs: Vec<PidSpec> = Vec::new();
    let mut explicit = false;
    if let Some(pids) = msg.u16_le_array_field(FieldType::PidArray)? {
        explicit = true;
        if pids.len() > N_PARTITIONS as usize {
            return Err(ScanError::Parameter("too many partition ids"));
        }
        for pid in pids {
            let pid = pid as u32;
            if pid >= N_PARTITIONS {
                return Err(ScanError::Parameter("partition id out of range"));
            }
            if requested[pid as usize] {
                return Err(ScanError::Parameter("duplicate partition id"));
            }
            requested[pid as usize] = true;
            specs.push(PidSpec { pid, start: None });
        }
    }
    if let Some(raw) = msg.field(FieldType::DigestArray) {
        explicit = true;
        if raw.len() % DIGEST_LEN != 0 || raw.len() / DIGEST_LEN > N_PARTITIONS as usize {
            return Err(ScanError::Parameter("bad digest array"));
        }
        for chunk in raw.chunks_exact(DIGEST_LEN) {
            let Some(digest) = Digest::from_slice(chunk) else {
                return Err(ScanError::Parameter("bad digest array"));
            };
            let pid = digest.partition_id();
            if requested[pid as usize] {
                return Err(ScanError::Parameter("duplicate partition id"));
            }
            requested[pid as usize] = true;
            specs.push(PidSpec { pid, start: Some(digest) });
        }
    }
    let selection =
        if explicit { PartitionSelection::Explicit(specs) } else { PartitionSelection::All };

    let sample_max = msg.u64_be_field(FieldType::SampleMax)?.unwrap_or(0);
    if sample_max > 0 && sample_pct < 100 {
        tracing::warn!(
            sample_max,
            sample_pct,
            "scan specifies both sample-max and sample-pct; using sample-max"
        );
        sample_pct = 100;
    }

    let rps = match msg.u32_be_field(FieldType::RecsPerSec)? {
        Some(rps) => rps,
        None if priority == 1 => LEGACY_PRIORITY_RPS,
        None => 0,
    };

    let socket_timeout = match msg.u32_be_field(FieldType::SocketTimeout)?.unwrap_or(0) {
        0 => None,
        ms => Some(Duration::from_millis(ms as u64)),
    };

    let trid = match msg.u64_be_field(FieldType::Trid)? {
        Some(trid) => trid,
        None => NEXT_TRID.fetch_add(1, Ordering::Relaxed),
    };

    // A whole-namespace scan of a set the namespace has never seen has
    // nothing to do; report it synchronously. Per-partition scans instead
    // mark each partition done.
    if set_sel == SetSelector::Unresolved && !selection.is_per_partition() {
        return Err(ScanError::NotFound);
    }

    Ok(CommonParams {
        namespace,
        set_name,
        set_sel,
        selection,
        rps,
        sample_pct,
        sample_max,
        fail_on_cluster_change,
        socket_timeout,
        trid,
    })
}

fn compile_predicate(
    env: &ScanEnv,
    msg: &ScanMessage,
) -> Result<Option<Arc<dyn Predicate>>, ScanError> {
    let Some(raw) = msg.field(FieldType::Predexp) else {
        return Ok(None);
    };
    let Some(compiler) = &env.predicates else {
        return Err(ScanError::Parameter("predicate filters not supported"));
    };
    match compiler.compile(raw) {
        Ok(predicate) => Ok(Some(predicate)),
        Err(err) => {
            tracing::warn!(error = %err, "failed to compile scan predicate");
            Err(ScanError::Parameter("bad predicate expression"))
        }
    }
}

fn parse_udf_call(msg: &ScanMessage) -> Result<UdfCall, ScanError> {
    let filename =
        msg.str_field(FieldType::UdfFilename)?.ok_or(ScanError::Parameter("missing UDF filename"))?;
    if filename.is_empty() || filename.len() > MAX_UDF_FILENAME_LEN {
        return Err(ScanError::Parameter("bad UDF filename"));
    }
    let function =
        msg.str_field(FieldType::UdfFunction)?.ok_or(ScanError::Parameter("missing UDF function"))?;
    if function.is_empty() || function.len() > MAX_UDF_FUNCTION_LEN {
        return Err(ScanError::Parameter("bad UDF function"));
    }
    let arglist = msg.field(FieldType::UdfArglist).cloned().unwrap_or_default();
    Ok(UdfCall { filename: filename.to_string(), function: function.to_string(), arglist })
}

/// Parses `msg`, builds the matching scan job, and admits it.
///
/// On success, streaming jobs own the socket until their terminal fin, and
/// background jobs have already acknowledged fin-OK and detached it. On
/// failure the socket stays with `channel` so the originating request path
/// reports the error code itself.
pub async fn start_scan(
    env: &ScanEnv,
    manager: &ScanManager,
    msg: &ScanMessage,
    channel: &mut ClientChannel,
) -> Result<(), ScanError> {
    match infer_scan_type(msg)? {
        ScanType::Basic => start_basic(env, manager, msg, channel).await,
        ScanType::Aggr => start_aggr(env, manager, msg, channel).await,
        ScanType::UdfBg => {
            start_background(env, manager, msg, channel, JobKind::UdfBackground).await
        }
        ScanType::OpsBg => {
            start_background(env, manager, msg, channel, JobKind::OpsBackground).await
        }
    }
}

async fn start_basic(
    env: &ScanEnv,
    manager: &ScanManager,
    msg: &ScanMessage,
    channel: &mut ClientChannel,
) -> Result<(), ScanError> {
    let params = parse_common(env, msg)?;
    if params.fail_on_cluster_change && env.cluster.migrations_in_progress() {
        return Err(ScanError::ClusterKeyMismatch);
    }
    let predicate = compile_predicate(env, msg)?;
    let no_bin_data = msg.info1.contains(Info1::GET_NO_BINS);
    let bin_names = {
        let names: Vec<String> = msg
            .ops
            .iter()
            .filter(|op| op.op == OpType::Read)
            .map(|op| op.bin.clone())
            .collect();
        if names.is_empty() { None } else { Some(names) }
    };

    let client = channel.peer().to_string();
    let conn = ClientConn::adopt(channel, params.socket_timeout)?;
    let core = JobCore::new(
        JobKind::Basic,
        params.trid,
        params.namespace,
        params.set_name,
        params.set_sel,
        params.selection,
        params.rps,
        client,
    );
    let job = Arc::new(BasicScanJob::new(
        core,
        conn,
        env.cluster.clone(),
        params.fail_on_cluster_change,
        no_bin_data,
        params.sample_pct,
        params.sample_max,
        predicate,
        bin_names,
    ));

    if let Err(err) = manager.start_job(job.clone()) {
        job.rollback(channel).await;
        return Err(err);
    }
    Ok(())
}

async fn start_aggr(
    env: &ScanEnv,
    manager: &ScanManager,
    msg: &ScanMessage,
    channel: &mut ClientChannel,
) -> Result<(), ScanError> {
    let params = parse_common(env, msg)?;
    if env.udf_execution_disabled.load(Ordering::Acquire) {
        return Err(ScanError::Forbidden);
    }
    if msg.field(FieldType::Predexp).is_some() {
        return Err(ScanError::Unsupported("predicate filters on aggregation scans"));
    }
    if params.selection.is_per_partition() {
        return Err(ScanError::Unsupported("per-partition aggregation scans"));
    }
    let call = parse_udf_call(msg)?;

    let client = channel.peer().to_string();
    let conn = ClientConn::adopt(channel, params.socket_timeout)?;
    let core = JobCore::new(
        JobKind::Aggregation,
        params.trid,
        params.namespace,
        params.set_name,
        params.set_sel,
        params.selection,
        params.rps,
        client,
    );
    let job = Arc::new(AggrScanJob::new(core, conn, env.aggregation.clone(), call));

    if let Err(err) = manager.start_job(job.clone()) {
        job.rollback(channel).await;
        return Err(err);
    }
    Ok(())
}

async fn start_background(
    env: &ScanEnv,
    manager: &ScanManager,
    msg: &ScanMessage,
    channel: &mut ClientChannel,
    kind: JobKind,
) -> Result<(), ScanError> {
    let params = parse_common(env, msg)?;

    let mut rps = params.rps;
    let cap = params.namespace.background_scan_max_rps();
    if cap != 0 {
        if rps > cap {
            return Err(ScanError::Parameter("rps exceeds the background scan limit"));
        }
        if rps == 0 {
            rps = cap;
        }
    }

    let (origin_kind, flags) = match kind {
        JobKind::UdfBackground => {
            if env.udf_execution_disabled.load(Ordering::Acquire) {
                return Err(ScanError::Forbidden);
            }
            (OriginKind::Udf(parse_udf_call(msg)?), WriteFlags::default())
        }
        _ => {
            if msg.info1.contains(Info1::READ) {
                return Err(ScanError::Parameter("ops scan request must be write-only"));
            }
            if msg.ops.is_empty() {
                return Err(ScanError::Parameter("ops scan request carries no ops"));
            }
            let flags = WriteFlags {
                durable_delete: msg.info2.contains(Info2::DURABLE_DELETE),
                update_only: msg.info3.contains(Info3::UPDATE_ONLY),
                replace_only: msg.info3.contains(Info3::REPLACE_ONLY),
            };
            (OriginKind::Ops(msg.ops.clone()), flags)
        }
    };
    let predicate = compile_predicate(env, msg)?;

    let client = channel.peer().to_string();
    let core = JobCore::new(
        kind,
        params.trid,
        params.namespace.clone(),
        params.set_name,
        params.set_sel,
        params.selection,
        rps,
        client,
    );
    let n_active = Arc::new(AtomicU32::new(0));
    let origin = Arc::new(TransactionOrigin::new(
        params.namespace,
        origin_kind,
        flags,
        predicate,
        completion_hook(core.counters().clone(), n_active.clone()),
    ));
    let job = Arc::new(BgScanJob::new(core, origin, env.transactions.clone(), n_active));

    manager.start_job(job)?;

    // Acknowledge acceptance and detach; the scan runs without the client.
    channel.reply_fin(ResultCode::Ok, params.socket_timeout).await;
    Ok(())
}
