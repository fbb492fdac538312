use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use lattice_proto::{BinValue, ResponseFrame, ResultCode};
use lattice_store::{ClusterInfo, PartitionReservation, PredOutcome, Predicate};

use crate::api::JobStat;
use crate::conn::{ClientConn, ResponseBuffer};
use crate::job::{JobCore, PidSpec, ScanJob, SetSelector};

/// Extra per-partition budget granted under absolute-max sampling, covering
/// unevenly filled partitions.
pub(crate) const SAMPLE_MARGIN: u64 = 4;

/// How a basic slice limits its traversal.
enum SampleMode {
    /// Visit every live record.
    Full,
    /// Consider at most `left` index entries, tombstones included: percent
    /// sampling measures the index as seen.
    Percent { left: u64 },
    /// Consider at most `left` live records; the shared sample counter
    /// decides which one is the last overall.
    Max { left: u64 },
}

/// Streams record data (optionally bin-filtered or metadata-only) back to
/// the client, chunked and throttled.
pub(crate) struct BasicScanJob {
    core: JobCore,
    conn: ClientConn,
    cluster: Arc<dyn ClusterInfo>,
    cluster_key: u64,
    fail_on_cluster_change: bool,
    no_bin_data: bool,
    sample_pct: u8,
    sample_max: u64,
    max_per_partition: u64,
    sample_count: AtomicU64,
    predicate: Option<Arc<dyn Predicate>>,
    bin_names: Option<Vec<String>>,
}

impl BasicScanJob {
    pub(crate) fn new(
        core: JobCore,
        conn: ClientConn,
        cluster: Arc<dyn ClusterInfo>,
        fail_on_cluster_change: bool,
        no_bin_data: bool,
        sample_pct: u8,
        sample_max: u64,
        predicate: Option<Arc<dyn Predicate>>,
        bin_names: Option<Vec<String>>,
    ) -> Self {
        let n_pids = core.selection().n_requested().max(1);
        let max_per_partition =
            if sample_max == 0 { 0 } else { sample_max.div_ceil(n_pids) + SAMPLE_MARGIN };
        let cluster_key = cluster.cluster_key();
        Self {
            core,
            conn,
            cluster,
            cluster_key,
            fail_on_cluster_change,
            no_bin_data,
            sample_pct,
            sample_max,
            max_per_partition,
            sample_count: AtomicU64::new(0),
            predicate,
            bin_names,
        }
    }

    pub(crate) async fn rollback(&self, channel: &mut crate::conn::ClientChannel) {
        self.conn.disown(channel).await;
    }

    fn sample_mode(&self, tree_size: u64) -> SampleMode {
        if self.sample_max > 0 {
            SampleMode::Max { left: self.max_per_partition }
        } else if self.sample_pct < 100 {
            SampleMode::Percent { left: tree_size * self.sample_pct as u64 / 100 }
        } else {
            SampleMode::Full
        }
    }
}

#[async_trait]
impl ScanJob for BasicScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn slice(&self, spec: &PidSpec, rsv: Option<PartitionReservation>) {
        let per_partition = self.core.selection().is_per_partition();
        let mut buf = ResponseBuffer::new();

        let Some(rsv) = rsv else {
            // Legacy whole-namespace scans skip unmastered partitions
            // silently; per-partition scans report them.
            if per_partition {
                buf.push(&ResponseFrame::PartitionDone {
                    result: ResultCode::Unavailable,
                    pid: spec.pid,
                });
                self.conn.send_buffer(&self.core, &mut buf).await;
            }
            return;
        };

        if self.core.set_selector() == SetSelector::Unresolved {
            // The set has no records here by definition.
            if per_partition {
                buf.push(&ResponseFrame::PartitionDone { result: ResultCode::Ok, pid: spec.pid });
                self.conn.send_buffer(&self.core, &mut buf).await;
            }
            return;
        }

        let tree = rsv.tree();
        let mut mode = self.sample_mode(tree.size());
        let mut cursor = tree.cursor_from(spec.start);
        let namespace = self.core.namespace();
        let counters = self.core.counters();

        while let Some(entry) = cursor.next_entry() {
            if self.core.is_abandoned() {
                return;
            }
            if self.fail_on_cluster_change && self.cluster.cluster_key() != self.cluster_key {
                self.core.abandon(ResultCode::ClusterKeyMismatch);
                return;
            }

            match &mut mode {
                SampleMode::Percent { left } => {
                    if *left == 0 {
                        break;
                    }
                    *left -= 1;
                    if entry.tombstone {
                        continue;
                    }
                }
                SampleMode::Max { left } => {
                    if entry.tombstone {
                        continue;
                    }
                    if *left == 0 {
                        break;
                    }
                    *left -= 1;
                }
                SampleMode::Full => {
                    if entry.tombstone {
                        continue;
                    }
                }
            }

            if !self.core.set_selector().admits(entry.set_id) {
                continue;
            }
            if entry.doomed {
                continue;
            }

            let meta_verdict = self.predicate.as_ref().map(|p| p.eval_meta(&entry));
            if meta_verdict == Some(PredOutcome::False) {
                counters.n_filtered_meta.fetch_add(1, Ordering::AcqRel);
                continue;
            }

            let Some(record) = namespace.open_record(&entry.digest) else {
                counters.n_failed.fetch_add(1, Ordering::AcqRel);
                continue;
            };

            if meta_verdict == Some(PredOutcome::Unknown) {
                let passes = self
                    .predicate
                    .as_ref()
                    .map(|p| p.eval_record(record.as_ref()))
                    .unwrap_or(true);
                if !passes {
                    counters.n_filtered_bins.fetch_add(1, Ordering::AcqRel);
                    drop(record);
                    if !namespace.data_in_memory() {
                        let delay = self.core.throttle_delay();
                        if delay > Duration::ZERO {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    continue;
                }
            }

            let mut last_sample = false;
            if self.sample_max > 0 {
                let sampled = self.sample_count.fetch_add(1, Ordering::AcqRel) + 1;
                if sampled > self.sample_max {
                    // Another slice took the last sample first.
                    break;
                }
                last_sample = sampled == self.sample_max;
            }

            let bins = if self.no_bin_data {
                Vec::new()
            } else {
                match record.bins(self.bin_names.as_deref()) {
                    Ok(bins) => bins,
                    Err(err) => {
                        counters.n_failed.fetch_add(1, Ordering::AcqRel);
                        tracing::debug!(
                            trid = self.core.trid(),
                            digest = %entry.digest,
                            error = %err,
                            "failed to load bins"
                        );
                        continue;
                    }
                }
            };
            let frame = ResponseFrame::Record {
                digest: *entry.digest.as_bytes(),
                generation: entry.generation,
                expiration: entry.expiration,
                set_name: namespace.set_name(entry.set_id).unwrap_or_default(),
                no_bin_data: self.no_bin_data,
                bins: bins
                    .into_iter()
                    .map(|bin| BinValue { name: bin.name, value: bin.value })
                    .collect(),
            };
            drop(record);

            buf.push(&frame);
            counters.n_succeeded.fetch_add(1, Ordering::AcqRel);

            if buf.is_full() && !self.conn.send_buffer(&self.core, &mut buf).await {
                return;
            }

            if last_sample {
                break;
            }
            let delay = self.core.throttle_delay();
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }

        if self.core.is_abandoned() {
            return;
        }
        if per_partition {
            buf.push(&ResponseFrame::PartitionDone { result: ResultCode::Ok, pid: spec.pid });
        }
        if buf.has_payload() {
            self.conn.send_buffer(&self.core, &mut buf).await;
        }
    }

    async fn finish(&self) {
        let code = self.core.abandon_code().unwrap_or(ResultCode::Ok);
        self.conn.send_fin(code).await;

        let stats = self.core.namespace().stats();
        match code {
            ResultCode::Ok => stats.scan_basic_complete.fetch_add(1, Ordering::AcqRel),
            ResultCode::UserAbort => stats.scan_basic_abort.fetch_add(1, Ordering::AcqRel),
            _ => stats.scan_basic_error.fetch_add(1, Ordering::AcqRel),
        };
    }

    fn info(&self) -> JobStat {
        self.core.stat(self.conn.net_io_bytes(), self.conn.timeout_ms(), None)
    }
}
