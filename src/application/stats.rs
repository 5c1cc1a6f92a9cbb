//! Read-only reporting snapshot.

use serde::Serialize;

use crate::application::repos::TaskCounts;
use crate::application::watchdog::WatchdogStats;
use crate::cache::CacheStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub active_uploads: usize,
    pub pending: u64,
    pub uploading: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub pending_deletion: u64,
}

impl QueueStats {
    pub fn new(active_uploads: usize, counts: TaskCounts) -> Self {
        Self {
            active_uploads,
            pending: counts.pending,
            uploading: counts.uploading,
            completed: counts.completed,
            abandoned: counts.abandoned,
            pending_deletion: counts.pending_deletion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub watchdog: WatchdogStats,
    pub cache: CacheStats,
    pub queue: QueueStats,
}
