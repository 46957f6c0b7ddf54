//! Enforcement sinks (Proxmox cluster IPSet, host-local nftables set).

pub mod cluster;
pub mod local;

pub use cluster::ClusterSink;
pub use local::LocalSink;

/// Outcome of one grouped cluster update. Per-IP failures are counted, not
/// propagated; only auth failures abort a batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct BulkSummary {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
}
