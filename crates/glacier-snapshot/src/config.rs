//! Tuning knobs and per-operation statistics.

use std::time::Duration;

/// Engine configuration. Plain data with defaults that suit an
/// interactive VM; construct with struct update syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// LZ4-compress pages on save.
    pub compress: bool,
    /// Load pages on first guest access instead of up front. Falls back
    /// to eager loading on hosts without a fault watcher.
    pub on_demand: bool,
    /// Decompressor pool size; 0 inflates on the reader thread.
    pub decompress_workers: usize,
    /// Capacity of the to-read page queue.
    pub read_queue_capacity: usize,
    /// Capacity of the decompressed-and-waiting page queue.
    pub filled_queue_capacity: usize,
    /// A crash this soon after a snapshot load finished is blamed on the
    /// snapshot, which then gets invalidated.
    pub crash_window: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            compress: true,
            on_demand: true,
            decompress_workers: 2,
            read_queue_capacity: 32,
            filled_queue_capacity: 32,
            crash_window: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Save,
    Load,
}

/// Outcome summary of the most recent save or load.
#[derive(Debug, Clone)]
pub struct OperationStats {
    pub kind: OpKind,
    pub name: String,
    pub succeeded: bool,
    pub duration: Duration,
    /// Bytes of `ram.bin` on disk.
    pub disk_size: u64,
    pub compressed: bool,
    pub on_demand: bool,
}

/// Hook for surfacing operation outcomes to the embedding application.
pub trait SnapshotObserver: Send + Sync {
    fn operation_finished(&self, stats: &OperationStats);
}
