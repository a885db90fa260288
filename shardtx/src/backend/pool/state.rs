use std::ops::Deref;
use std::time::Duration;

use tokio::time::Instant;

use super::Pool;

/// Pool state.
#[derive(Debug)]
pub struct State {
    inner: shardtx_stats::PoolState,
}

impl Deref for State {
    type Target = shardtx_stats::PoolState;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl State {
    pub(super) fn get(pool: &Pool) -> Self {
        let now = Instant::now();
        let mut guard = pool.lock();
        guard.prune_waiters();

        State {
            inner: shardtx_stats::PoolState {
                online: guard.online,
                capacity: guard.config.capacity,
                active: guard.active,
                in_use: guard.in_use,
                idle: guard.idle(),
                waiting: guard.waiting.len(),
                maxwait: guard
                    .waiting
                    .front()
                    .map(|waiter| now.duration_since(waiter.since))
                    .unwrap_or(Duration::ZERO),
                counts: guard.counts,
            },
        }
    }
}
