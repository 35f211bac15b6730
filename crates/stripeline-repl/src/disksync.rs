//! When the destination forces replica data to stable storage.

/// Sync cadence for replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSyncPolicy {
    /// Sync after every this many written bytes; 0 disables.
    pub sync_rate: u64,
    /// Sync after every this many completed stripes; 0 disables.
    pub stripe_interval: u64,
}

impl DiskSyncPolicy {
    /// Byte-count counter for this policy.
    pub fn byte_cycle(&self) -> ByteSyncCycle {
        ByteSyncCycle {
            threshold: self.sync_rate,
            pending: 0,
        }
    }

    /// Stripe counter for this policy.
    pub fn stripe_counter(&self) -> StripeSyncCounter {
        StripeSyncCounter {
            interval: self.stripe_interval,
            completed: 0,
        }
    }
}

/// Cumulative written-bytes counter. Lives for a whole session, so the
/// cadence carries over from one file to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteSyncCycle {
    threshold: u64,
    pending: u64,
}

impl ByteSyncCycle {
    /// Accounts `n` written bytes. Returns true when a sync is due.
    pub fn record(&mut self, n: u64) -> bool {
        if self.threshold == 0 {
            return false;
        }
        self.pending += n;
        if self.pending >= self.threshold {
            self.pending -= self.threshold;
            return true;
        }
        false
    }
}

/// Counts completed stripes of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripeSyncCounter {
    interval: u64,
    completed: u64,
}

impl StripeSyncCounter {
    /// Accounts one completed stripe. Returns true when a sync is due.
    pub fn stripe_done(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.completed += 1;
        if self.completed >= self.interval {
            self.completed = 0;
            return true;
        }
        false
    }
}
