//! Connection pool.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{lock_api::MutexGuard, Mutex, RawMutex};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::driver::Connector;
use crate::backend::{Connection, Error as BackendError};
use crate::context::Context;
use crate::env::Env;
use crate::ticker::Ticker;

use super::{Config, Error, Grant, Guard, Inner, Reserved, State, Waiting};

/// Connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<InnerSync>,
}

pub(crate) struct InnerSync {
    inner: Mutex<Inner>,
    connector: Connector,
    killer: Option<Pool>,
    env: Env,
    /// Notified when the last connection of a closed pool comes back.
    drained: Notify,
    monitor: Mutex<Option<Ticker>>,
    /// Every checkout opens a fresh, untracked connection.
    no_pool: bool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params = self.inner.connector.params();
        f.debug_struct("Pool")
            .field("addr", &format!("{}:{}", params.host, params.port))
            .field("user", &params.user)
            .finish()
    }
}

enum Checkout {
    Ready(Connection),
    Create,
    Wait(Waiting),
}

impl Pool {
    /// Create a new pool. It doesn't accept checkouts until opened.
    ///
    /// Capacity `0` disables pooling: each checkout opens its own connection.
    pub fn new(config: Config, connector: Connector, killer: Option<Pool>, env: &Env) -> Self {
        Self {
            inner: Arc::new(InnerSync {
                inner: Mutex::new(Inner::new(config)),
                connector,
                killer,
                env: env.clone(),
                drained: Notify::new(),
                monitor: Mutex::new(None),
                no_pool: config.capacity == 0,
            }),
        }
    }

    /// Bring the pool online and start idle eviction.
    pub fn open(&self) {
        let config = {
            let mut guard = self.lock();
            if guard.online {
                return;
            }
            guard.online = true;
            guard.config
        };

        if !self.inner.no_pool && !config.idle_timeout.is_zero() {
            let pool = Arc::downgrade(&self.inner);
            let ticker = Ticker::start(
                "pool idle",
                config.idle_check_interval(),
                self.inner.env.stats().clone(),
                move || Self::close_idle(pool.clone()),
            );
            *self.inner.monitor.lock() = Some(ticker);
        }

        debug!("pool opened with capacity {} [{:?}]", config.capacity, self);
    }

    async fn close_idle(pool: Weak<InnerSync>) {
        if let Some(inner) = pool.upgrade() {
            let removed = inner.inner.lock().close_idle(Instant::now());
            if removed > 0 {
                debug!("closed {} idle connections", removed);
            }
        }
    }

    /// Get a connection from the pool.
    ///
    /// Waits until the context deadline or the checkout timeout, whichever is sooner.
    pub async fn get(&self, ctx: &Context) -> Result<Guard, BackendError> {
        if self.inner.no_pool {
            if !self.lock().online {
                return Err(Error::Offline.into());
            }
            let conn = self.connect().await?;
            return Ok(Guard::unpooled(conn));
        }

        let checkout = {
            let mut guard = self.lock();

            if !guard.online {
                return Err(Error::Offline.into());
            }

            if let Some(conn) = guard.take() {
                Checkout::Ready(conn)
            } else if guard.can_create() {
                guard.reserve_slot();
                Checkout::Create
            } else {
                Checkout::Wait(Waiting::new(self, &mut guard)?)
            }
        };

        match checkout {
            Checkout::Ready(conn) => Ok(Guard::new(self.clone(), conn)),
            Checkout::Create => self.create().await,
            Checkout::Wait(waiting) => {
                let deadline = ctx.deadline_or(self.config().checkout_timeout);
                match waiting.wait(deadline).await? {
                    Grant::Conn(conn) => Ok(Guard::new(self.clone(), conn)),
                    Grant::Slot => self.create().await,
                }
            }
        }
    }

    /// Open a connection in a slot already accounted for.
    async fn create(&self) -> Result<Guard, BackendError> {
        let slot = Reserved::new(self);
        let conn = self.connect().await?;
        Ok(slot.fill(conn))
    }

    async fn connect(&self) -> Result<Connection, BackendError> {
        let conn =
            Connection::connect(&self.inner.connector, self.inner.killer.clone(), &self.inner.env)
                .await?;
        self.lock().counts.connects += 1;
        Ok(conn)
    }

    /// Return a connection. `None` frees its slot instead.
    pub fn put(&self, conn: Option<Connection>) {
        let drained = {
            let mut guard = self.lock();
            guard.check_in(conn);
            !guard.online && guard.active == 0
        };

        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Change the number of connections the pool may hold.
    pub fn set_capacity(&self, capacity: i64) -> Result<(), Error> {
        let capacity = usize::try_from(capacity).map_err(|_| Error::NegativeCapacity(capacity))?;
        self.lock().set_capacity(capacity);
        info!("pool capacity set to {} [{:?}]", capacity, self);
        Ok(())
    }

    /// Shut down, waiting for every checked out connection to come back.
    pub async fn close(&self) {
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        self.lock().shutdown();

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().active == 0 {
                break;
            }

            notified.await;
        }

        debug!("pool closed [{:?}]", self);
    }

    /// Pool state snapshot.
    pub fn state(&self) -> State {
        State::get(self)
    }

    pub fn capacity(&self) -> usize {
        self.lock().config.capacity
    }

    pub fn config(&self) -> Config {
        self.lock().config
    }

    pub(super) fn record_wait(&self, elapsed: Duration) {
        let mut guard = self.lock();
        guard.counts.wait_count += 1;
        guard.counts.wait_time += elapsed;
    }

    #[inline]
    pub(super) fn lock(&self) -> MutexGuard<'_, RawMutex, Inner> {
        self.inner.inner.lock()
    }
}
