//! Serving state machine for transactions.
//!
//! Begins are only accepted in the two accepting states. A transition
//! blocks new begins, waits for in-flight ones, shuts down the previous
//! mode and brings up the new one.

use std::fmt::Display;
use std::sync::Arc;

use parking_lot::Mutex;
use shardtx_config::CoordinatorKind;
use shardtx_stats::EngineState;
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};
use tokio::time::sleep;
use tokio::{select, spawn};
use tracing::{debug, error, info};

use crate::backend::stateful::{Conclusion, StatefulConnection};
use crate::backend::{ConnParams, Connector, Driver, QueryResult};
use crate::context::Context;
use crate::env::Env;
use crate::ticker::Ticker;
use crate::two_pc::{Coordinator, LocalCoordinator, PreparedPool, SqlStore, TwoPcStore};

use super::{Error, TxOptions, TxPool};

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotServing,
    Transitioning,
    AcceptingReadAndWrite,
    AcceptingReadOnly,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Transaction engine.
#[derive(Debug, Clone)]
pub struct TxEngine {
    pub(crate) inner: Arc<Inner>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) env: Env,
    pub(crate) connector: Connector,
    pub(crate) tx_pool: TxPool,
    pub(crate) prepared: PreparedPool,
    pub(crate) store: Arc<dyn TwoPcStore>,
    pub(crate) coordinator: Option<Arc<dyn Coordinator>>,
    pub(crate) watchdog: Mutex<Option<Ticker>>,
    state: Mutex<State>,
    /// Held for reading by every begin in flight.
    begins: Arc<RwLock<()>>,
    transition: AsyncMutex<()>,
}

impl TxEngine {
    /// Engine with the configured coordinator and the SQL redo log.
    pub fn new(env: &Env, driver: Arc<dyn Driver>) -> Self {
        let connector = Connector::new(driver, ConnParams::app(&env.config().database));
        let coordinator: Option<Arc<dyn Coordinator>> = match env.config().two_pc.coordinator {
            CoordinatorKind::None => None,
            CoordinatorKind::Local => Some(Arc::new(LocalCoordinator)),
        };

        Self::with_parts(env, connector, Arc::new(SqlStore::new(env)), coordinator)
    }

    /// Engine with explicit collaborators.
    pub fn with_parts(
        env: &Env,
        connector: Connector,
        store: Arc<dyn TwoPcStore>,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Self {
        let capacity = env.config().tx_pool.size.saturating_sub(2).max(1);

        Self {
            inner: Arc::new(Inner {
                env: env.clone(),
                connector,
                tx_pool: TxPool::new(env),
                prepared: PreparedPool::new(capacity),
                store,
                coordinator,
                watchdog: Mutex::new(None),
                state: Mutex::new(State::NotServing),
                begins: Arc::new(RwLock::new(())),
                transition: AsyncMutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock()
    }

    pub fn env(&self) -> &Env {
        &self.inner.env
    }

    pub fn tx_pool(&self) -> &TxPool {
        &self.inner.tx_pool
    }

    pub(crate) fn two_pc_enabled(&self) -> bool {
        self.inner.env.config().two_pc.enabled
    }

    /// Accept reads and writes. Recovers prepared transactions when 2PC is on.
    pub async fn accept_read_write(&self) {
        self.transition(State::AcceptingReadAndWrite).await;
    }

    /// Accept read-only transactions.
    pub async fn accept_read_only(&self) {
        self.transition(State::AcceptingReadOnly).await;
    }

    /// Stop serving. Open transactions are rolled back right away.
    pub async fn close(&self) {
        let _transition = self.inner.transition.lock().await;
        let previous = self.block_begins().await;

        if previous != State::NotServing {
            self.shutdown(true).await;
        }

        self.set_state(State::NotServing);
    }

    async fn transition(&self, target: State) {
        let _transition = self.inner.transition.lock().await;

        if self.state() == target {
            return;
        }

        info!("tx engine transition: {}", target);

        let previous = self.block_begins().await;
        match previous {
            State::AcceptingReadAndWrite => self.shutdown(true).await,
            State::AcceptingReadOnly => self.shutdown(false).await,
            _ => (),
        }

        self.inner.tx_pool.open(&self.inner.connector);

        if target == State::AcceptingReadAndWrite && self.two_pc_enabled() {
            self.inner.prepared.open();
            if let Err(err) = self.inner.store.open(&self.inner.connector).await {
                error!("could not open redo log: {}", err);
            }
            if let Err(err) = self.prepare_from_redo().await {
                error!("could not recover prepared transactions: {}", err);
            }
            if self.inner.coordinator.is_some() {
                self.start_watchdog();
            }
        }

        self.set_state(target);
    }

    /// Move to Transitioning and wait for begins in flight. Returns the state we left.
    async fn block_begins(&self) -> State {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            *state = State::Transitioning;
            previous
        };

        drop(self.inner.begins.write().await);

        previous
    }

    fn set_state(&self, state: State) {
        *self.inner.state.lock() = state;
        debug!("tx engine state: {}", state);
    }

    /// Roll back and close everything.
    ///
    /// Immediate shutdown rolls back right away. Otherwise transactions get the
    /// grace period to finish on their own. A zero grace period waits forever,
    /// after releasing prepared transactions which would never finish.
    async fn shutdown(&self, immediate: bool) {
        self.stop_watchdog().await;

        let grace = self
            .inner
            .env
            .config()
            .general
            .shutdown_grace_period_duration();
        let tx_pool = &self.inner.tx_pool;
        tx_pool.scp().shutdown_non_tx();

        let (empty_tx, empty_rx) = oneshot::channel::<()>();
        let engine = self.clone();

        let decision = spawn(async move {
            if immediate {
                info!("immediate shutdown: rolling back now");
                engine.shutdown_transactions().await;
                return;
            }

            if grace.is_zero() {
                engine.rollback_all_prepared().await;
                info!("no grace period: waiting for transactions to finish");
                return;
            }

            select! {
                _ = sleep(grace) => {
                    info!("grace period exceeded: rolling back now");
                    engine.shutdown_transactions().await;
                }

                _ = empty_rx => {
                    info!("transactions completed before grace period");
                }
            }
        });

        tx_pool.wait_for_empty().await;

        // Stands down the grace timer if it's still running.
        let _ = empty_tx.send(());
        if let Err(err) = decision.await {
            error!("shutdown task failed: {}", err);
        }

        tx_pool.close().await;
        self.inner.store.close().await;
    }

    async fn shutdown_transactions(&self) {
        self.rollback_all_prepared().await;
        self.inner.tx_pool.shutdown(&Context::default()).await;
    }

    /// Roll back every prepared transaction held in memory.
    pub(crate) async fn rollback_all_prepared(&self) {
        let ctx = Context::default();
        for conn in self.inner.prepared.fetch_all_for_rollback() {
            self.inner.tx_pool.rollback_and_release(&ctx, conn).await;
        }
    }

    /// Start a transaction. Returns its id and the statements that opened it.
    pub async fn begin(
        &self,
        ctx: &Context,
        options: &TxOptions,
        pre_queries: &[String],
    ) -> Result<(i64, String), Error> {
        self.begin_on(ctx, options, None, pre_queries).await
    }

    async fn begin_on(
        &self,
        ctx: &Context,
        options: &TxOptions,
        reserved_id: Option<i64>,
        pre_queries: &[String],
    ) -> Result<(i64, String), Error> {
        let (_begin, read_only) = {
            let state = self.inner.state.lock();
            let read_only = match *state {
                State::AcceptingReadAndWrite => false,
                State::AcceptingReadOnly => true,
                state => return Err(Error::NotAccepting(state)),
            };
            let begin = self
                .inner
                .begins
                .clone()
                .try_read_owned()
                .map_err(|_| Error::NotAccepting(*state))?;
            (begin, read_only)
        };

        let (conn, statements) = self
            .inner
            .tx_pool
            .begin(ctx, options, read_only, reserved_id, pre_queries)
            .await?;
        let id = conn.id();
        self.inner.tx_pool.scp().unlock(conn, true);

        Ok((id, statements))
    }

    /// Commit a transaction. A reserved connection stays reserved under the returned id.
    pub async fn commit(&self, ctx: &Context, id: i64) -> Result<Option<i64>, Error> {
        let tx_pool = &self.inner.tx_pool;
        let mut conn = tx_pool.get_and_lock(id, "for commit")?;
        let result = tx_pool.commit(ctx, &mut conn).await.map(|_| ());
        self.finish(conn, "commit", result)
    }

    /// Roll back a transaction. A reserved connection stays reserved under the returned id.
    pub async fn rollback(&self, ctx: &Context, id: i64) -> Result<Option<i64>, Error> {
        let tx_pool = &self.inner.tx_pool;
        let mut conn = tx_pool.get_and_lock(id, "for rollback")?;
        let result = tx_pool.rollback(ctx, &mut conn).await;
        self.finish(conn, "rollback", result)
    }

    /// Release a finished transaction's connection, or renew it if it's reserved.
    fn finish(
        &self,
        mut conn: StatefulConnection,
        reason: &str,
        result: Result<(), Error>,
    ) -> Result<Option<i64>, Error> {
        let scp = self.inner.tx_pool.scp();

        if let Err(err) = result {
            scp.release(conn, reason);
            return Err(err);
        }

        if !conn.is_tainted() {
            scp.release(conn, reason);
            return Ok(None);
        }

        match scp.renew(&mut conn) {
            Ok(()) => {
                let id = conn.id();
                scp.unlock(conn, true);
                Ok(Some(id))
            }
            Err(err) => {
                conn.close();
                scp.release(conn, "renew failed");
                Err(err.into())
            }
        }
    }

    /// Run a statement on a transaction or reserved connection.
    ///
    /// Statements that change data are remembered for the redo log.
    pub async fn execute(
        &self,
        ctx: &Context,
        id: i64,
        query: &str,
        max_rows: usize,
    ) -> Result<QueryResult, Error> {
        let scp = self.inner.tx_pool.scp();
        let mut conn = scp.get_and_lock(id, "for query")?;

        let result = conn.exec(ctx, query, max_rows).await;
        if result.is_ok() && !is_read(query) {
            conn.record_query(query);
        }
        // A lost connection takes its transaction with it.
        if conn.is_closed() {
            self.inner.tx_pool.tx_complete(&mut conn, Conclusion::Close);
        }
        scp.unlock(conn, true);

        Ok(result?)
    }

    /// Reserve a connection for use across calls, or reserve the
    /// connection of transaction `id`.
    pub async fn reserve(
        &self,
        ctx: &Context,
        id: Option<i64>,
        pre_queries: &[String],
    ) -> Result<i64, Error> {
        let scp = self.inner.tx_pool.scp();

        let mut conn = match id {
            Some(id) => scp.get_and_lock(id, "to reserve")?,
            None => {
                let state = self.state();
                if !matches!(
                    state,
                    State::AcceptingReadAndWrite | State::AcceptingReadOnly
                ) {
                    return Err(Error::NotAccepting(state));
                }
                scp.new_conn(ctx, false).await?
            }
        };

        conn.taint(&ctx.caller);

        for query in pre_queries {
            if let Err(err) = conn.exec(ctx, query, 1).await {
                conn.close();
                scp.release(conn, "reserve failed");
                return Err(err.into());
            }
        }

        let id = conn.id();
        scp.unlock(conn, true);

        Ok(id)
    }

    /// Reserve a connection and start a transaction on it.
    pub async fn reserve_begin(
        &self,
        ctx: &Context,
        options: &TxOptions,
        pre_queries: &[String],
    ) -> Result<(i64, String), Error> {
        let id = self.reserve(ctx, None, pre_queries).await?;
        self.begin_on(ctx, options, Some(id), &[]).await
    }

    /// Give up a reserved connection, rolling back any transaction on it.
    pub async fn release(&self, ctx: &Context, id: i64) -> Result<(), Error> {
        let tx_pool = &self.inner.tx_pool;
        let mut conn = tx_pool.get_and_lock(id, "for release")?;
        let result = tx_pool.rollback(ctx, &mut conn).await;
        tx_pool.scp().release(conn, "release");
        result
    }

    /// State snapshot for reporting.
    pub fn engine_state(&self) -> EngineState {
        let stats = self.inner.env.stats();
        EngineState {
            state: self.state().to_string(),
            connections: self.inner.tx_pool.scp().size(),
            prepared: self.inner.prepared.len(),
            unresolved_prepared: stats.unresolved_prepared(),
            counts: stats.counts(),
        }
    }
}

/// Statements that don't change anything.
fn is_read(query: &str) -> bool {
    let word = query
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_lowercase();

    matches!(
        word.as_str(),
        "select" | "show" | "explain" | "describe" | "desc" | "set" | "use"
    )
}
