//! Point-in-time counters for a thread pool.

/// Snapshot returned by [`crate::ThreadPool::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Running worker threads
    pub live: usize,
    /// Workers counted idle, including reserved threads not yet running
    pub idle: usize,
    /// Reserved launches not yet running
    pub starting: usize,
    pub spinning: usize,
    pub created_total: u64,
    pub retired_total: u64,
    pub queued_tasks: usize,
}

impl PoolStats {
    /// Workers currently running a task
    pub fn busy(&self) -> usize {
        (self.live + self.starting).saturating_sub(self.idle)
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "live={} idle={} starting={} spinning={} created={} retired={} queued={}",
            self.live,
            self.idle,
            self.starting,
            self.spinning,
            self.created_total,
            self.retired_total,
            self.queued_tasks
        )
    }
}
