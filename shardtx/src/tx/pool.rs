//! Transaction lifecycle on top of the stateful connection pool.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::backend::stateful::{Conclusion, StatefulConnection, StatefulConnectionPool, TxProperties};
use crate::backend::Connector;
use crate::context::Context;
use crate::env::Env;
use crate::ticker::Ticker;
use crate::util::human_duration;

use super::{Error, Isolation, Limiter, TxOptions};

/// Begins, finishes and times out transactions.
#[derive(Debug, Clone)]
pub struct TxPool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    env: Env,
    scp: StatefulConnectionPool,
    limiter: Limiter,
    sweep: Mutex<Option<Ticker>>,
}

impl TxPool {
    pub fn new(env: &Env) -> Self {
        Self {
            inner: Arc::new(Inner {
                env: env.clone(),
                scp: StatefulConnectionPool::new(env),
                limiter: Limiter::new(env),
                sweep: Mutex::new(None),
            }),
        }
    }

    /// Open connection pools and start the timeout sweep.
    pub fn open(&self, connector: &Connector) {
        self.inner.scp.open(connector);

        let timeout = self.inner.env.config().tx_pool.timeout_duration();
        let pool = Arc::downgrade(&self.inner);
        let ticker = Ticker::start(
            "transaction killer",
            timeout / 10,
            self.inner.env.stats().clone(),
            move || Self::transaction_killer(pool.clone()),
        );

        *self.inner.sweep.lock() = Some(ticker);
    }

    /// Stop the sweep and close connection pools.
    pub async fn close(&self) {
        let sweep = self.inner.sweep.lock().take();
        if let Some(sweep) = sweep {
            sweep.stop().await;
        }
        self.inner.scp.close().await;
    }

    /// Start a transaction, returning the locked connection and the statements that opened it.
    ///
    /// With `reserved_id`, the transaction starts on that reserved connection
    /// instead of a new one, and the limiter isn't consulted.
    pub async fn begin(
        &self,
        ctx: &Context,
        options: &TxOptions,
        read_only: bool,
        reserved_id: Option<i64>,
        pre_queries: &[String],
    ) -> Result<(StatefulConnection, String), Error> {
        let scp = &self.inner.scp;
        let limiter = &self.inner.limiter;

        let (mut conn, limited) = match reserved_id {
            Some(id) => {
                let conn = scp.get_and_lock(id, "start transaction on reserved conn")?;
                if conn.is_in_transaction() {
                    scp.unlock(conn, false);
                    return Err(Error::NestedTransaction(id));
                }
                (conn, false)
            }

            None => {
                if !limiter.get(&ctx.caller) {
                    return Err(Error::LimitExceeded);
                }
                match scp.new_conn(ctx, options.found_rows).await {
                    Ok(conn) => (conn, true),
                    Err(err) => {
                        limiter.release(&ctx.caller);
                        return Err(err.into());
                    }
                }
            }
        };

        match self
            .start(ctx, &mut conn, options, read_only, pre_queries)
            .await
        {
            Ok(statements) => {
                let mut props = TxProperties::new(
                    &ctx.caller,
                    options.isolation == Isolation::Autocommit,
                    read_only,
                );
                props.limited = limited;
                conn.set_tx_props(props);
                self.inner.env.stats().begin();
                Ok((conn, statements))
            }

            Err(err) => {
                conn.close();
                scp.release(conn, "begin failed");
                if limited {
                    limiter.release(&ctx.caller);
                }
                Err(err)
            }
        }
    }

    async fn start(
        &self,
        ctx: &Context,
        conn: &mut StatefulConnection,
        options: &TxOptions,
        read_only: bool,
        pre_queries: &[String],
    ) -> Result<String, Error> {
        let statements = options.isolation.statements(read_only);

        for statement in &statements {
            conn.exec(ctx, statement, 1).await?;
        }

        for query in pre_queries {
            conn.exec(ctx, query, 1).await?;
        }

        Ok(statements.join("; "))
    }

    /// Commit the transaction. Autocommit transactions have nothing to commit.
    pub async fn commit(&self, ctx: &Context, conn: &mut StatefulConnection) -> Result<String, Error> {
        let Some(autocommit) = conn.tx_props().map(|props| props.autocommit) else {
            return Err(Error::NotInTransaction(conn.id()));
        };

        if autocommit {
            self.tx_complete(conn, Conclusion::Commit);
            return Ok(String::new());
        }

        let result = conn.exec(ctx, "commit", 1).await;
        if result.is_err() {
            conn.close();
        }
        self.tx_complete(conn, Conclusion::Commit);
        result?;

        Ok("commit".into())
    }

    /// Roll back the transaction. No-op outside a transaction.
    pub async fn rollback(&self, ctx: &Context, conn: &mut StatefulConnection) -> Result<(), Error> {
        let Some(autocommit) = conn.tx_props().map(|props| props.autocommit) else {
            return Ok(());
        };

        if conn.is_closed() {
            self.tx_complete(conn, Conclusion::Close);
            return Ok(());
        }

        if autocommit {
            self.tx_complete(conn, Conclusion::Commit);
            return Ok(());
        }

        let result = conn.exec(ctx, "rollback", 1).await;
        if result.is_err() {
            conn.close();
        }
        self.tx_complete(conn, Conclusion::Rollback);
        result?;

        Ok(())
    }

    /// Finish whatever is open: roll back a transaction, nothing otherwise.
    pub async fn complete(&self, ctx: &Context, conn: &mut StatefulConnection) -> Result<(), Error> {
        self.rollback(ctx, conn).await
    }

    /// Roll back and release. Rollback failures are logged, not returned.
    pub async fn rollback_and_release(&self, ctx: &Context, mut conn: StatefulConnection) {
        if let Err(err) = self.rollback(ctx, &mut conn).await {
            error!("transaction {}: rollback failed: {}", conn.id(), err);
        }
        self.inner.scp.release(conn, "rollback");
    }

    /// Roll back every idle transaction. Connections still in use are
    /// closed when they come back.
    pub async fn shutdown(&self, ctx: &Context) {
        for conn in self.inner.scp.shutdown_all() {
            self.rollback_and_release(ctx, conn).await;
        }
    }

    /// Lock a connection for `purpose`.
    pub fn get_and_lock(&self, id: i64, purpose: &str) -> Result<StatefulConnection, Error> {
        Ok(self.inner.scp.get_and_lock(id, purpose)?)
    }

    /// Stateful connections backing this pool.
    pub fn scp(&self) -> &StatefulConnectionPool {
        &self.inner.scp
    }

    pub fn limiter(&self) -> &Limiter {
        &self.inner.limiter
    }

    pub fn adjust_last_id(&self, id: i64) {
        self.inner.scp.adjust_last_id(id);
    }

    pub async fn wait_for_empty(&self) {
        self.inner.scp.wait_for_empty().await;
    }

    /// Close out transaction bookkeeping. Runs at most once per transaction.
    pub(crate) fn tx_complete(&self, conn: &mut StatefulConnection, conclusion: Conclusion) {
        let Some(mut props) = conn.take_tx_props() else {
            return;
        };
        props.conclusion = Some(conclusion);

        if props.limited {
            self.inner.limiter.release(&props.caller);
        }

        let stats = self.inner.env.stats();
        match conclusion {
            Conclusion::Commit => stats.commit(),
            Conclusion::Rollback => stats.rollback(),
            _ => (),
        }

        info!(
            id = conn.id(),
            conclusion = %conclusion,
            duration = %human_duration(props.duration()),
            statements = props.queries.len(),
            caller = %props.caller,
            "transaction complete"
        );
    }

    async fn transaction_killer(pool: Weak<Inner>) {
        if let Some(inner) = pool.upgrade() {
            Self { inner }.sweep().await;
        }
    }

    /// Kill transactions and reservations idle longer than the timeout.
    pub(crate) async fn sweep(&self) {
        let timeout = self.inner.env.config().tx_pool.timeout_duration();
        let stats = self.inner.env.stats();
        let ctx = Context::default().with_timeout(timeout);

        for mut conn in self
            .inner
            .scp
            .get_outdated(timeout, "for tx killer rollback")
        {
            if conn.is_tainted() {
                conn.close();
                stats.reserved_kill();
                warn!("killing reserved connection {} [timeout]", conn.id());
            }

            if conn.is_in_transaction() {
                stats.transaction_kill();
                warn!(
                    "killing transaction {} after {} [timeout]",
                    conn.id(),
                    human_duration(conn.tx_props().map(|p| p.duration()).unwrap_or_default())
                );

                if conn.exec(&ctx, "rollback", 1).await.is_err() {
                    conn.close();
                }
                self.tx_complete(&mut conn, Conclusion::Kill);
            }

            self.inner.scp.release(
                conn,
                &format!("exceeded timeout: {}", human_duration(timeout)),
            );
        }
    }
}
