//! Engine counters.
//!
//! Updated from any task with atomics and read as a [`Counts`] snapshot.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use fnv::FnvHashMap;
use parking_lot::Mutex;
use shardtx_stats::Counts;

#[derive(Debug, Default)]
pub struct Stats {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    query_kills: AtomicUsize,
    hung_queries: AtomicUsize,
    transaction_kills: AtomicUsize,
    reserved_kills: AtomicUsize,
    limiter_rejections: AtomicUsize,
    limiter_dry_run: AtomicUsize,
    prepares: AtomicUsize,
    commit_prepared: AtomicUsize,
    commit_prepared_failed: AtomicUsize,
    rollback_prepared: AtomicUsize,
    redo_failed: AtomicUsize,
    watchdog_failures: AtomicUsize,
    internal_errors: AtomicUsize,
    unresolved_prepared: AtomicU64,
    rejections_by_key: Mutex<FnvHashMap<String, usize>>,
    dry_run_by_key: Mutex<FnvHashMap<String, usize>>,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Stats {
    counter!(begin, begins);
    counter!(commit, commits);
    counter!(rollback, rollbacks);
    counter!(query_kill, query_kills);
    counter!(hung_query, hung_queries);
    counter!(transaction_kill, transaction_kills);
    counter!(reserved_kill, reserved_kills);
    counter!(prepare, prepares);
    counter!(commit_prepared, commit_prepared);
    counter!(commit_prepared_failed, commit_prepared_failed);
    counter!(rollback_prepared, rollback_prepared);
    counter!(redo_failed, redo_failed);
    counter!(watchdog_failure, watchdog_failures);
    counter!(internal_error, internal_errors);

    /// Limiter turned a caller away.
    pub fn limiter_rejection(&self, key: &str) {
        self.limiter_rejections.fetch_add(1, Ordering::Relaxed);
        *self.rejections_by_key.lock().entry(key.to_string()).or_default() += 1;
    }

    /// Limiter would have turned a caller away.
    pub fn limiter_dry_run(&self, key: &str) {
        self.limiter_dry_run.fetch_add(1, Ordering::Relaxed);
        *self.dry_run_by_key.lock().entry(key.to_string()).or_default() += 1;
    }

    pub fn rejections(&self, key: &str) -> usize {
        self.rejections_by_key.lock().get(key).copied().unwrap_or(0)
    }

    pub fn dry_run_rejections(&self, key: &str) -> usize {
        self.dry_run_by_key.lock().get(key).copied().unwrap_or(0)
    }

    pub fn set_unresolved_prepared(&self, count: u64) {
        self.unresolved_prepared.store(count, Ordering::Relaxed);
    }

    pub fn unresolved_prepared(&self) -> u64 {
        self.unresolved_prepared.load(Ordering::Relaxed)
    }

    /// Snapshot of all counters.
    pub fn counts(&self) -> Counts {
        let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);

        Counts {
            begins: get(&self.begins),
            commits: get(&self.commits),
            rollbacks: get(&self.rollbacks),
            query_kills: get(&self.query_kills),
            hung_queries: get(&self.hung_queries),
            transaction_kills: get(&self.transaction_kills),
            reserved_kills: get(&self.reserved_kills),
            limiter_rejections: get(&self.limiter_rejections),
            limiter_dry_run: get(&self.limiter_dry_run),
            prepares: get(&self.prepares),
            commit_prepared: get(&self.commit_prepared),
            commit_prepared_failed: get(&self.commit_prepared_failed),
            rollback_prepared: get(&self.rollback_prepared),
            redo_failed: get(&self.redo_failed),
            watchdog_failures: get(&self.watchdog_failures),
            internal_errors: get(&self.internal_errors),
        }
    }
}
