//! Periodic check for abandoned distributed transactions.

use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::context::Context;
use crate::ticker::Ticker;
use crate::tx::engine::Inner;
use crate::tx::TxEngine;

impl TxEngine {
    /// Check for abandoned transactions every half abandon age.
    pub(crate) fn start_watchdog(&self) {
        let period = self.inner.env.config().two_pc.abandon_age_duration() / 2;
        let engine = Arc::downgrade(&self.inner);
        let ticker = Ticker::start(
            "2pc watchdog",
            period,
            self.inner.env.stats().clone(),
            move || Self::watchdog(engine.clone()),
        );

        *self.inner.watchdog.lock() = Some(ticker);
    }

    pub(crate) async fn stop_watchdog(&self) {
        let watchdog = self.inner.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            watchdog.stop().await;
        }
    }

    async fn watchdog(engine: Weak<Inner>) {
        if let Some(inner) = engine.upgrade() {
            TxEngine { inner }.check_abandoned().await;
        }
    }

    /// Refresh the unresolved gauge and hand abandoned transactions to the coordinator.
    pub(crate) async fn check_abandoned(&self) {
        let config = self.inner.env.config();
        let stats = self.inner.env.stats();
        let abandon_age = config.two_pc.abandon_age_duration();
        let ctx = Context::default().with_timeout(abandon_age / 2);

        let before = chrono::Duration::from_std(abandon_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        match self.inner.store.count_unresolved_redo(&ctx, before).await {
            Ok(count) => stats.set_unresolved_prepared(count),
            Err(err) => {
                error!("could not count unresolved prepared transactions: {}", err);
                stats.watchdog_failure();
            }
        }

        let dtids = match self.inner.store.read_abandoned(&ctx, before).await {
            Ok(dtids) => dtids,
            Err(err) => {
                error!("could not read abandoned transactions: {}", err);
                stats.watchdog_failure();
                return;
            }
        };

        if dtids.is_empty() {
            return;
        }

        let Some(coordinator) = self.inner.coordinator.clone() else {
            return;
        };

        warn!("found {} abandoned distributed transactions", dtids.len());

        let session = match coordinator.connect(&ctx, self).await {
            Ok(session) => session,
            Err(err) => {
                error!("could not connect to coordinator: {}", err);
                stats.watchdog_failure();
                return;
            }
        };

        let session = &session;
        let ctx = &ctx;
        let results = join_all(dtids.iter().map(|dtid| async move {
            (dtid, session.resolve_transaction(ctx, dtid).await)
        }))
        .await;

        for (dtid, result) in results {
            match result {
                Ok(()) => debug!("resolved \"{}\"", dtid),
                Err(err) => {
                    error!("could not resolve \"{}\": {}", dtid, err);
                    stats.watchdog_failure();
                }
            }
        }

        session.close().await;
    }
}
