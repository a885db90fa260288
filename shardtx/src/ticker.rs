//! Cancellable periodic background task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::stats::Stats;

/// Runs a closure on a fixed interval until stopped.
///
/// A tick that panics is logged and counted. The next tick runs as usual.
#[derive(Debug)]
pub struct Ticker {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start<F, Fut>(name: &'static str, period: Duration, stats: Arc<Stats>, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!("[{}] started", name);

            loop {
                select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        if AssertUnwindSafe(f()).catch_unwind().await.is_err() {
                            error!("[{}] tick panicked", name);
                            stats.internal_error();
                        }
                    }
                }
            }

            debug!("[{}] stopped", name);
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the task and wait for the current tick to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!("[{}] task failed: {}", self.name, err);
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
