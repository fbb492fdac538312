/// Cluster topology, as seen by the scan core.
pub trait ClusterInfo: Send + Sync {
    /// Current cluster key; changes whenever the partition map changes.
    fn cluster_key(&self) -> u64;

    /// True while partition migrations are in progress.
    fn migrations_in_progress(&self) -> bool;
}
