use async_trait::async_trait;
use bytes::Bytes;

use crate::namespace::Namespace;
use crate::partition::PartitionTree;
use crate::record::Digest;

/// A UDF call descriptor: module, function, and serialized arguments.
#[derive(Debug, Clone)]
pub struct UdfCall {
    /// UDF module file name.
    pub filename: String,
    /// Function name within the module.
    pub function: String,
    /// Serialized argument list, opaque to the scan core.
    pub arglist: Bytes,
}

/// Receives aggregation result values, chunking them onto the client
/// connection. A write error means the client is gone and the aggregation
/// should stop.
#[async_trait]
pub trait ValueSink: Send {
    /// Streams one serialized result value.
    async fn write(&mut self, value: Bytes) -> anyhow::Result<()>;
}

/// One partition's worth of aggregation input.
pub struct AggregationTask<'a> {
    /// Namespace the digests belong to.
    pub namespace: &'a Namespace,
    /// The UDF to apply.
    pub call: &'a UdfCall,
    /// Digests collected from the partition, in digest order.
    pub digests: &'a [Digest],
    /// The reserved partition's tree, for re-opening records by digest.
    pub tree: &'a dyn PartitionTree,
}

/// The UDF aggregation runtime, as seen by the scan core.
#[async_trait]
pub trait AggregationRuntime: Send + Sync {
    /// Runs the aggregation over one partition's digest list, streaming
    /// values through `out`. An error abandons the owning scan.
    async fn aggregate(
        &self,
        task: AggregationTask<'_>,
        out: &mut dyn ValueSink,
    ) -> anyhow::Result<()>;
}
