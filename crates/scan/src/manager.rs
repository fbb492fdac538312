use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use lattice_proto::ResultCode;

use crate::api::{JobKind, JobStat, JobStatus, ScanConfig, ScanError};
use crate::job::{PidSpec, ScanJob};

enum WorkerCommand {
    Slice { job: Arc<dyn ScanJob>, spec: PidSpec },
    Stop,
}

enum RuntimeMsg {
    Enqueue(Vec<SliceTask>),
    SliceDone { worker_idx: usize },
    Shutdown,
}

struct SliceTask {
    job: Arc<dyn ScanJob>,
    spec: PidSpec,
}

struct Registry {
    active: HashMap<u64, Arc<dyn ScanJob>>,
    active_counts: HashMap<(String, JobKind), usize>,
    finished: VecDeque<JobStat>,
}

struct ManagerInner {
    cfg: ScanConfig,
    registry: Mutex<Registry>,
    runtime_tx: mpsc::UnboundedSender<RuntimeMsg>,
}

/// Process-wide registry and scheduler for scan jobs.
///
/// Owns a fixed pool of slice workers. Admitted jobs are expanded into
/// `(job, partition)` tasks; each task reserves its partition, runs the
/// job's slice, and releases the reservation. The worker completing a job's
/// last slice runs its finish hook and moves the stats to a bounded
/// finished ring.
pub struct ScanManager {
    inner: Arc<ManagerInner>,
}

impl ScanManager {
    /// Starts the manager and its worker pool. Must be called within a
    /// tokio runtime. Zero config values fall back to the defaults.
    pub fn new(mut cfg: ScanConfig) -> Self {
        if cfg.threads == 0 {
            cfg.threads = ScanConfig::DEFAULT_THREADS;
        }
        if cfg.active_cap == 0 {
            cfg.active_cap = ScanConfig::DEFAULT_ACTIVE_CAP;
        }
        if cfg.finished_cap == 0 {
            cfg.finished_cap = ScanConfig::DEFAULT_FINISHED_CAP;
        }

        let (runtime_tx, runtime_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            cfg,
            registry: Mutex::new(Registry {
                active: HashMap::new(),
                active_counts: HashMap::new(),
                finished: VecDeque::new(),
            }),
            runtime_tx,
        });

        let mut worker_cmds = Vec::with_capacity(inner.cfg.threads);
        let mut worker_join = JoinSet::new();
        for worker_idx in 0..inner.cfg.threads {
            let (tx, rx) = mpsc::channel::<WorkerCommand>(1);
            worker_cmds.push(tx);
            let runtime_tx = inner.runtime_tx.clone();
            let inner = inner.clone();
            worker_join.spawn(async move {
                run_worker(worker_idx, rx, runtime_tx, inner).await;
            });
        }

        tokio::spawn(run_dispatcher(runtime_rx, worker_cmds, worker_join));

        Self { inner }
    }

    /// Registers `job` and schedules its slices.
    ///
    /// Fails on a duplicate trid or when the per-namespace cap for the
    /// variant is reached; the job is untouched on failure.
    pub(crate) fn start_job(&self, job: Arc<dyn ScanJob>) -> Result<(), ScanError> {
        let core = job.core();
        let trid = core.trid();
        let kind = core.kind();
        let ns_name = core.namespace().name().to_string();
        let specs = core.selection().slice_specs();

        {
            let mut registry = self.inner.lock_registry();
            if registry.active.contains_key(&trid) {
                return Err(ScanError::Parameter("duplicate scan trid"));
            }
            let count = registry.active_counts.entry((ns_name.clone(), kind)).or_insert(0);
            if *count >= self.inner.cfg.active_cap {
                return Err(ScanError::JobLimit);
            }
            *count += 1;
            core.set_total_slices(specs.len());
            registry.active.insert(trid, job.clone());
        }

        tracing::info!(
            trid,
            kind = kind.tag(),
            namespace = ns_name.as_str(),
            client = core.client(),
            n_slices = specs.len(),
            "scan job started"
        );

        if specs.is_empty() {
            // Nothing to scan; finish on a detached task.
            let inner = self.inner.clone();
            tokio::spawn(async move {
                job.finish().await;
                inner.retire(&job);
            });
            return Ok(());
        }

        let tasks = specs
            .into_iter()
            .map(|spec| SliceTask { job: job.clone(), spec })
            .collect();
        if self.inner.runtime_tx.send(RuntimeMsg::Enqueue(tasks)).is_err() {
            let mut registry = self.inner.lock_registry();
            registry.active.remove(&trid);
            if let Some(count) = registry.active_counts.get_mut(&(ns_name, kind)) {
                *count = count.saturating_sub(1);
            }
            return Err(ScanError::Shutdown);
        }
        Ok(())
    }

    /// User-initiated cancel. True iff a matching active job existed.
    pub fn abort_job(&self, trid: u64) -> bool {
        let registry = self.inner.lock_registry();
        match registry.active.get(&trid) {
            Some(job) => {
                job.core().abandon(ResultCode::UserAbort);
                true
            }
            None => false,
        }
    }

    /// Cancels every active job, returning how many were found.
    pub fn abort_all(&self) -> usize {
        let registry = self.inner.lock_registry();
        for job in registry.active.values() {
            job.core().abandon(ResultCode::UserAbort);
        }
        registry.active.len()
    }

    /// Snapshot of one job, active or finished.
    pub fn get_job_info(&self, trid: u64) -> Option<JobStat> {
        let registry = self.inner.lock_registry();
        if let Some(job) = registry.active.get(&trid) {
            return Some(job.info());
        }
        registry.finished.iter().find(|stat| stat.trid == trid).cloned()
    }

    /// Snapshot of every active and recently finished job.
    pub fn get_info(&self) -> Vec<JobStat> {
        let registry = self.inner.lock_registry();
        let mut stats: Vec<JobStat> = registry.active.values().map(|job| job.info()).collect();
        stats.extend(registry.finished.iter().cloned());
        stats
    }

    /// Trims the finished ring to its configured cap.
    pub fn limit_finished_jobs(&self) {
        let mut registry = self.inner.lock_registry();
        while registry.finished.len() > self.inner.cfg.finished_cap {
            registry.finished.pop_front();
        }
    }

    /// Cancels all jobs and stops the worker pool. Workers finish the slice
    /// they are on; queued slices are dropped.
    pub fn shutdown(&self) {
        self.abort_all();
        let _ = self.inner.runtime_tx.send(RuntimeMsg::Shutdown);
    }
}

impl ManagerInner {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves a finished job out of the active set and into the ring.
    fn retire(&self, job: &Arc<dyn ScanJob>) {
        let mut stat = job.info();
        stat.status = JobStatus::Done;

        let core = job.core();
        let mut registry = self.lock_registry();
        registry.active.remove(&core.trid());
        let key = (core.namespace().name().to_string(), core.kind());
        if let Some(count) = registry.active_counts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                registry.active_counts.remove(&key);
            }
        }
        registry.finished.push_back(stat);
        while registry.finished.len() > self.cfg.finished_cap {
            registry.finished.pop_front();
        }
        drop(registry);

        tracing::info!(
            trid = core.trid(),
            kind = core.kind().tag(),
            namespace = core.namespace().name(),
            result = core.abandon_code().unwrap_or(ResultCode::Ok).name(),
            "scan job finished"
        );
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<RuntimeMsg>,
    worker_cmds: Vec<mpsc::Sender<WorkerCommand>>,
    mut worker_join: JoinSet<()>,
) {
    let mut pending: VecDeque<SliceTask> = VecDeque::new();
    let mut idle = vec![true; worker_cmds.len()];

    loop {
        // Hand queued slices to idle workers.
        while !pending.is_empty() {
            let Some(worker_idx) = idle.iter().position(|is_idle| *is_idle) else {
                break;
            };
            let Some(task) = pending.pop_front() else {
                break;
            };
            idle[worker_idx] = false;
            let cmd = WorkerCommand::Slice { job: task.job, spec: task.spec };
            if worker_cmds[worker_idx].send(cmd).await.is_err() {
                return;
            }
        }

        match rx.recv().await {
            None => break,
            Some(RuntimeMsg::Enqueue(tasks)) => pending.extend(tasks),
            Some(RuntimeMsg::SliceDone { worker_idx }) => idle[worker_idx] = true,
            Some(RuntimeMsg::Shutdown) => break,
        }
    }

    for tx in &worker_cmds {
        let _ = tx.send(WorkerCommand::Stop).await;
    }
    while worker_join.join_next().await.is_some() {}
}

async fn run_worker(
    worker_idx: usize,
    mut rx: mpsc::Receiver<WorkerCommand>,
    runtime_tx: mpsc::UnboundedSender<RuntimeMsg>,
    inner: Arc<ManagerInner>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Stop => break,
            WorkerCommand::Slice { job, spec } => {
                let rsv = job.core().namespace().reserve(spec.pid);
                job.slice(&spec, rsv).await;
                if job.core().slice_done() {
                    job.finish().await;
                    inner.retire(&job);
                }
                let _ = runtime_tx.send(RuntimeMsg::SliceDone { worker_idx });
            }
        }
    }
}
