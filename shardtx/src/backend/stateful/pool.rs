//! Pool of stateful connections, addressable by id across calls.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::backend::pool::{self, Pool};
use crate::backend::{ConnParams, Connector};
use crate::context::Context;
use crate::env::Env;
use crate::util::unix_nanos;

use super::registry::Mode;
use super::{Error, Registry, StatefulConnection};

#[derive(Debug, Clone)]
struct Pools {
    conns: Pool,
    found_rows: Pool,
    killer: Pool,
}

/// Hands out stateful connections and tracks them until released.
#[derive(Debug)]
pub struct StatefulConnectionPool {
    env: Env,
    registry: Registry,
    pools: RwLock<Option<Pools>>,
    last_id: AtomicI64,
}

impl StatefulConnectionPool {
    /// Ids start at the current time so they don't repeat across restarts.
    pub fn new(env: &Env) -> Self {
        Self {
            env: env.clone(),
            registry: Registry::new(env.config().general.ended_cache_size),
            pools: RwLock::new(None),
            last_id: AtomicI64::new(unix_nanos(Utc::now())),
        }
    }

    /// Open the connection pools.
    pub fn open(&self, connector: &Connector) {
        let config = self.env.config();
        let driver = connector.driver().clone();

        let killer = Pool::new(
            pool::Config::kill_pool(config),
            Connector::new(driver.clone(), ConnParams::dba(&config.database)),
            None,
            &self.env,
        );
        let conns = Pool::new(
            pool::Config::tx_pool(config),
            connector.clone(),
            Some(killer.clone()),
            &self.env,
        );
        let found_rows = Pool::new(
            pool::Config::tx_pool(config),
            Connector::new(driver, connector.params().with_found_rows()),
            Some(killer.clone()),
            &self.env,
        );

        killer.open();
        conns.open();
        found_rows.open();

        self.registry.reset_mode();
        *self.pools.write() = Some(Pools {
            conns,
            found_rows,
            killer,
        });
    }

    /// Close the connection pools, waiting for leased connections to come back.
    pub async fn close(&self) {
        let pools = self.pools.write().take();
        if let Some(pools) = pools {
            pools.conns.close().await;
            pools.found_rows.close().await;
            pools.killer.close().await;
        }
    }

    /// Lease a new connection and register it, locked.
    pub async fn new_conn(
        &self,
        ctx: &Context,
        found_rows: bool,
    ) -> Result<StatefulConnection, Error> {
        let pools = self.pools.read().clone().ok_or(Error::Closed)?;
        let pool = if found_rows {
            &pools.found_rows
        } else {
            &pools.conns
        };

        let conn = pool.get(ctx).await?;
        let id = self.next_id();
        self.registry.register(id, "new connection");

        Ok(StatefulConnection::new(id, conn))
    }

    /// Lock a registered connection for `purpose`.
    pub fn get_and_lock(&self, id: i64, purpose: &str) -> Result<StatefulConnection, Error> {
        self.registry.get_and_lock(id, purpose)
    }

    /// Give a locked connection back to the registry.
    pub fn unlock(&self, mut conn: StatefulConnection, update_time: bool) {
        if conn.is_closed() {
            self.release(conn, "unlocked closed connection");
            return;
        }

        match self.registry.mode() {
            Mode::AllShutdown => {
                conn.close();
                self.release(conn, "pool is shut down");
            }
            Mode::NonTxShutdown if !conn.is_in_transaction() => {
                self.release(conn, "pool is shut down");
            }
            _ => {
                if let Err(conn) = self.registry.put_back(conn, update_time) {
                    debug!("connection {} unlocked after removal", conn.id());
                }
            }
        }
    }

    /// Remove a connection from the registry and return it to its pool.
    pub fn release(&self, mut conn: StatefulConnection, reason: &str) {
        // Open transactions never go back to the pool.
        if conn.is_in_transaction() {
            conn.close();
        }
        self.registry.remove(conn.id(), reason);
        debug!("released connection {}: {}", conn.id(), reason);
    }

    /// Give a reserved connection a fresh id, keeping it locked.
    pub fn renew(&self, conn: &mut StatefulConnection) -> Result<(), Error> {
        if !conn.is_tainted() {
            return Err(Error::NotTainted(conn.id()));
        }

        let old = conn.id();
        let new = self.next_id();
        self.registry
            .rename(old, new, &format!("renewed as {}", new))?;
        conn.set_id(new);

        Ok(())
    }

    /// Lock every idle connection unused for longer than `age`.
    pub fn get_outdated(&self, age: Duration, purpose: &str) -> Vec<StatefulConnection> {
        self.registry
            .take_matching(purpose, |_, idle| idle > age)
    }

    /// Release idle connections outside a transaction. Connections
    /// unlocked afterwards are released too unless in a transaction.
    pub fn shutdown_non_tx(&self) {
        self.registry.escalate(Mode::NonTxShutdown);
        let conns = self
            .registry
            .take_matching("for shutdown", |conn, _| !conn.is_in_transaction());
        for conn in conns {
            self.release(conn, "pool is shut down");
        }
    }

    /// Lock and return every idle connection. Connections unlocked
    /// afterwards are closed and released.
    pub fn shutdown_all(&self) -> Vec<StatefulConnection> {
        self.registry.escalate(Mode::AllShutdown);
        self.registry.take_matching("for shutdown", |_, _| true)
    }

    /// Resolves once every registered connection has been released.
    pub async fn wait_for_empty(&self) {
        self.registry.wait_for_empty().await
    }

    /// Make sure future ids are above `id`.
    pub fn adjust_last_id(&self, id: i64) {
        self.last_id.fetch_max(id, Ordering::SeqCst);
    }

    /// Maximum number of leased connections.
    pub fn capacity(&self) -> usize {
        match self.pools.read().as_ref() {
            Some(pools) => pools.conns.capacity(),
            None => self.env.config().tx_pool.size,
        }
    }

    /// Number of registered connections.
    pub fn size(&self) -> usize {
        self.registry.len()
    }

    fn next_id(&self) -> i64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}
