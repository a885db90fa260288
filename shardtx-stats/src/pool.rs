use std::{
    ops::{Add, Sub},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Pool state snapshot.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoolState {
    /// Pool is accepting checkouts.
    pub online: bool,
    /// Maximum number of connections.
    pub capacity: usize,
    /// Connections the pool is accounting for, idle or checked out.
    pub active: usize,
    /// Connections checked out by callers.
    pub in_use: usize,
    /// Idle connections.
    pub idle: usize,
    /// Callers waiting for a connection.
    pub waiting: usize,
    /// How long the oldest waiter has been waiting.
    pub maxwait: Duration,
    /// Pool counters.
    pub counts: PoolCounts,
}

/// Pool counters.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq)]
pub struct PoolCounts {
    /// How many times a caller had to wait for a connection.
    pub wait_count: usize,
    /// Total time callers spent waiting.
    pub wait_time: Duration,
    /// Connections closed by idle eviction.
    pub idle_closed: usize,
    /// Connections created.
    pub connects: usize,
    /// Checkouts that timed out.
    pub checkout_timeouts: usize,
}

impl Sub for PoolCounts {
    type Output = PoolCounts;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            wait_count: self.wait_count.saturating_sub(rhs.wait_count),
            wait_time: self.wait_time.saturating_sub(rhs.wait_time),
            idle_closed: self.idle_closed.saturating_sub(rhs.idle_closed),
            connects: self.connects.saturating_sub(rhs.connects),
            checkout_timeouts: self.checkout_timeouts.saturating_sub(rhs.checkout_timeouts),
        }
    }
}

impl Add for PoolCounts {
    type Output = PoolCounts;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            wait_count: self.wait_count.saturating_add(rhs.wait_count),
            wait_time: self.wait_time.saturating_add(rhs.wait_time),
            idle_closed: self.idle_closed.saturating_add(rhs.idle_closed),
            connects: self.connects.saturating_add(rhs.connects),
            checkout_timeouts: self.checkout_timeouts.saturating_add(rhs.checkout_timeouts),
        }
    }
}
