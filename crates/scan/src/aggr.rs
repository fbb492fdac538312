use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use lattice_proto::{ResponseFrame, ResultCode};
use lattice_store::{
    AggregationRuntime, AggregationTask, PartitionReservation, UdfCall, ValueSink,
};

use crate::api::JobStat;
use crate::conn::{ClientConn, ResponseBuffer};
use crate::job::{JobCore, PidSpec, ScanJob};

/// Streams the aggregation runtime's output values through the job's
/// chunked connection.
struct ChunkSink<'a> {
    core: &'a JobCore,
    conn: &'a ClientConn,
    buf: ResponseBuffer,
}

#[async_trait]
impl ValueSink for ChunkSink<'_> {
    async fn write(&mut self, value: Bytes) -> anyhow::Result<()> {
        self.buf.push(&ResponseFrame::Value { result: ResultCode::Ok, data: value });
        if self.buf.is_full() && !self.conn.send_buffer(self.core, &mut self.buf).await {
            anyhow::bail!("client connection lost");
        }
        Ok(())
    }
}

/// Collects each partition's digests and hands them to the UDF aggregation
/// runtime, streaming result values back to the client.
pub(crate) struct AggrScanJob {
    core: JobCore,
    conn: ClientConn,
    runtime: Arc<dyn AggregationRuntime>,
    call: UdfCall,
}

impl AggrScanJob {
    pub(crate) fn new(
        core: JobCore,
        conn: ClientConn,
        runtime: Arc<dyn AggregationRuntime>,
        call: UdfCall,
    ) -> Self {
        Self { core, conn, runtime, call }
    }

    pub(crate) async fn rollback(&self, channel: &mut crate::conn::ClientChannel) {
        self.conn.disown(channel).await;
    }
}

#[async_trait]
impl ScanJob for AggrScanJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn slice(&self, spec: &PidSpec, rsv: Option<PartitionReservation>) {
        let Some(rsv) = rsv else {
            return;
        };

        let tree = rsv.tree();
        let mut cursor = tree.cursor_from(spec.start);
        let mut digests = Vec::new();
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
            digests.push(entry.digest);
        }
        drop(cursor);
        if digests.is_empty() {
            return;
        }

        let mut sink = ChunkSink { core: &self.core, conn: &self.conn, buf: ResponseBuffer::new() };
        let task = AggregationTask {
            namespace: self.core.namespace().as_ref(),
            call: &self.call,
            digests: &digests,
            tree,
        };
        match self.runtime.aggregate(task, &mut sink).await {
            Ok(()) => {
                if sink.buf.has_payload() {
                    self.conn.send_buffer(&self.core, &mut sink.buf).await;
                }
            }
            Err(err) => {
                tracing::warn!(
                    trid = self.core.trid(),
                    filename = self.call.filename.as_str(),
                    function = self.call.function.as_str(),
                    error = %err,
                    "aggregation failed"
                );
                let mut buf = ResponseBuffer::new();
                buf.push(&ResponseFrame::Value {
                    result: ResultCode::Unknown,
                    data: Bytes::from(err.to_string().into_bytes()),
                });
                self.conn.send_buffer(&self.core, &mut buf).await;
                self.core.abandon(ResultCode::Unknown);
            }
        }
    }

    async fn finish(&self) {
        let code = self.core.abandon_code().unwrap_or(ResultCode::Ok);
        self.conn.send_fin(code).await;

        let stats = self.core.namespace().stats();
        match code {
            ResultCode::Ok => stats.scan_aggr_complete.fetch_add(1, Ordering::AcqRel),
            ResultCode::UserAbort => stats.scan_aggr_abort.fetch_add(1, Ordering::AcqRel),
            _ => stats.scan_aggr_error.fetch_add(1, Ordering::AcqRel),
        };
    }

    fn info(&self) -> JobStat {
        self.core.stat(self.conn.net_io_bytes(), self.conn.timeout_ms(), None)
    }
}
