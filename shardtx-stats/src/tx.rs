use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Engine counters.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq)]
pub struct Counts {
    /// Transactions started.
    pub begins: usize,
    /// Transactions committed.
    pub commits: usize,
    /// Transactions rolled back.
    pub rollbacks: usize,
    /// Queries killed, for any reason.
    pub query_kills: usize,
    /// Kills that didn't finish in time.
    pub hung_queries: usize,
    /// Transactions rolled back by the timeout sweep.
    pub transaction_kills: usize,
    /// Reserved connections closed by the timeout sweep.
    pub reserved_kills: usize,
    /// Begins rejected by the per-caller limiter.
    pub limiter_rejections: usize,
    /// Begins that would have been rejected in dry-run mode.
    pub limiter_dry_run: usize,
    /// Transactions prepared.
    pub prepares: usize,
    /// Prepared transactions committed.
    pub commit_prepared: usize,
    /// Prepared transactions that failed to commit.
    pub commit_prepared_failed: usize,
    /// Prepared transactions rolled back.
    pub rollback_prepared: usize,
    /// Redo log entries that couldn't be replayed.
    pub redo_failed: usize,
    /// Watchdog errors.
    pub watchdog_failures: usize,
    /// Background task panics.
    pub internal_errors: usize,
}

impl Sub for Counts {
    type Output = Counts;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            begins: self.begins.saturating_sub(rhs.begins),
            commits: self.commits.saturating_sub(rhs.commits),
            rollbacks: self.rollbacks.saturating_sub(rhs.rollbacks),
            query_kills: self.query_kills.saturating_sub(rhs.query_kills),
            hung_queries: self.hung_queries.saturating_sub(rhs.hung_queries),
            transaction_kills: self.transaction_kills.saturating_sub(rhs.transaction_kills),
            reserved_kills: self.reserved_kills.saturating_sub(rhs.reserved_kills),
            limiter_rejections: self
                .limiter_rejections
                .saturating_sub(rhs.limiter_rejections),
            limiter_dry_run: self.limiter_dry_run.saturating_sub(rhs.limiter_dry_run),
            prepares: self.prepares.saturating_sub(rhs.prepares),
            commit_prepared: self.commit_prepared.saturating_sub(rhs.commit_prepared),
            commit_prepared_failed: self
                .commit_prepared_failed
                .saturating_sub(rhs.commit_prepared_failed),
            rollback_prepared: self.rollback_prepared.saturating_sub(rhs.rollback_prepared),
            redo_failed: self.redo_failed.saturating_sub(rhs.redo_failed),
            watchdog_failures: self.watchdog_failures.saturating_sub(rhs.watchdog_failures),
            internal_errors: self.internal_errors.saturating_sub(rhs.internal_errors),
        }
    }
}

impl Add for Counts {
    type Output = Counts;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            begins: self.begins.saturating_add(rhs.begins),
            commits: self.commits.saturating_add(rhs.commits),
            rollbacks: self.rollbacks.saturating_add(rhs.rollbacks),
            query_kills: self.query_kills.saturating_add(rhs.query_kills),
            hung_queries: self.hung_queries.saturating_add(rhs.hung_queries),
            transaction_kills: self.transaction_kills.saturating_add(rhs.transaction_kills),
            reserved_kills: self.reserved_kills.saturating_add(rhs.reserved_kills),
            limiter_rejections: self
                .limiter_rejections
                .saturating_add(rhs.limiter_rejections),
            limiter_dry_run: self.limiter_dry_run.saturating_add(rhs.limiter_dry_run),
            prepares: self.prepares.saturating_add(rhs.prepares),
            commit_prepared: self.commit_prepared.saturating_add(rhs.commit_prepared),
            commit_prepared_failed: self
                .commit_prepared_failed
                .saturating_add(rhs.commit_prepared_failed),
            rollback_prepared: self.rollback_prepared.saturating_add(rhs.rollback_prepared),
            redo_failed: self.redo_failed.saturating_add(rhs.redo_failed),
            watchdog_failures: self.watchdog_failures.saturating_add(rhs.watchdog_failures),
            internal_errors: self.internal_errors.saturating_add(rhs.internal_errors),
        }
    }
}

/// Engine state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineState {
    /// Serving state name.
    pub state: String,
    /// Open stateful connections.
    pub connections: usize,
    /// Transactions held in the prepared area.
    pub prepared: usize,
    /// Prepared transactions in the redo log older than the abandon age.
    pub unresolved_prepared: u64,
    /// Counters.
    pub counts: Counts,
}
