use serde::{Deserialize, Serialize};

/// Latest reported load figures for one dispatcher.
///
/// Mutated only through the owning dispatcher's load report; read by the
/// monitor's ranking queries. Serializable so an admin/metrics plane can
/// export the cluster view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSnapshot {
    /// Number of live connections owned by the dispatcher
    pub connection_count: u32,
    /// CPU usage in percent (0-100)
    pub cpu_usage: u32,
    /// Pending cross-thread task queue length
    pub queue_length: u32,
    /// Total bytes moved through the dispatcher's connections
    pub total_bytes: u64,
}
