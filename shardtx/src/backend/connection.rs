//! Physical connection with reconnect and kill support.

use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};
use tokio::{pin, select};
use tracing::{debug, warn};

use crate::context::Context;
use crate::env::Env;
use crate::util::human_duration;

use super::driver::{Connector, QueryResult, RawConnection, StreamCallback};
use super::{Error, Pool};

/// A single link to the database.
///
/// Retries once on connection errors, never on SQL errors. A query running
/// past the caller's deadline is killed server-side through the kill pool.
/// Once killed, the connection stays dead and every call returns the kill error.
pub struct Connection {
    raw: Box<dyn RawConnection>,
    connector: Connector,
    killer: Option<Pool>,
    env: Env,
    killed: Option<Error>,
    current: Option<String>,
    created_at: Instant,
    last_used: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.raw.id())
            .field("closed", &self.raw.is_closed())
            .field("killed", &self.killed.is_some())
            .finish()
    }
}

impl Connection {
    /// Open a new connection.
    pub async fn connect(
        connector: &Connector,
        killer: Option<Pool>,
        env: &Env,
    ) -> Result<Self, Error> {
        let raw = connector.connect().await?;
        let now = Instant::now();

        debug!(
            "connected with id {} [{}:{}]",
            raw.id(),
            connector.params().host,
            connector.params().port
        );

        Ok(Self {
            raw,
            connector: connector.clone(),
            killer,
            env: env.clone(),
            killed: None,
            current: None,
            created_at: now,
            last_used: now,
        })
    }

    /// Server-assigned id.
    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    /// Query currently running, if any.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Execute a query, retrying once on a connection error.
    pub async fn exec(
        &mut self,
        ctx: &Context,
        query: &str,
        max_rows: usize,
    ) -> Result<QueryResult, Error> {
        match self.exec_once(ctx, query, max_rows).await {
            Err(err) if self.retryable(ctx, &err) => {
                debug!("retrying query after \"{}\" [{}]", err, self.id());
                self.reconnect().await?;
                self.exec_once(ctx, query, max_rows).await
            }
            result => result,
        }
    }

    /// Execute a query without retrying.
    pub async fn exec_once(
        &mut self,
        ctx: &Context,
        query: &str,
        max_rows: usize,
    ) -> Result<QueryResult, Error> {
        self.ready(ctx)?;

        let started = Instant::now();
        self.current = Some(query.to_string());

        let result = match ctx.deadline {
            None => self.raw.execute(query, max_rows).await,
            Some(deadline) => {
                let outcome = timeout_at(deadline, self.raw.execute(query, max_rows)).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        self.kill_on_deadline(started.elapsed()).await;
                        Err(self.kill_error())
                    }
                }
            }
        };

        self.current = None;
        self.last_used = Instant::now();

        result
    }

    /// Execute a query, handing results to `callback` as they arrive.
    ///
    /// Retried on a connection error only if nothing reached the callback yet.
    pub async fn stream(
        &mut self,
        ctx: &Context,
        query: &str,
        callback: &mut StreamCallback<'_>,
    ) -> Result<(), Error> {
        let mut delivered = 0_usize;
        let result = self
            .stream_once(ctx, query, &mut |result| {
                delivered += 1;
                callback(result)
            })
            .await;

        match result {
            Err(err) if delivered == 0 && self.retryable(ctx, &err) => {
                debug!("retrying stream after \"{}\" [{}]", err, self.id());
                self.reconnect().await?;
                self.stream_once(ctx, query, callback).await
            }
            result => result,
        }
    }

    async fn stream_once(
        &mut self,
        ctx: &Context,
        query: &str,
        callback: &mut StreamCallback<'_>,
    ) -> Result<(), Error> {
        self.ready(ctx)?;

        let started = Instant::now();
        self.current = Some(query.to_string());

        let result = match ctx.deadline {
            None => self.raw.stream(query, callback).await,
            Some(deadline) => {
                let outcome = timeout_at(deadline, self.raw.stream(query, callback)).await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        self.kill_on_deadline(started.elapsed()).await;
                        Err(self.kill_error())
                    }
                }
            }
        };

        self.current = None;
        self.last_used = Instant::now();

        result
    }

    /// Kill the running query and close the connection.
    ///
    /// Only the first call does anything.
    pub async fn kill(&mut self, reason: &str, elapsed: Duration) -> Result<(), Error> {
        if self.killed.is_some() {
            return Ok(());
        }

        let id = self.id();
        self.env.stats().query_kill();

        warn!(
            "killing query ID {} due to {}, elapsed time: {} \"{}\"",
            id,
            reason,
            human_duration(elapsed),
            self.current.as_deref().unwrap_or_default(),
        );

        self.killed = Some(Error::Killed {
            reason: reason.to_string(),
            elapsed: human_duration(elapsed),
            id,
        });
        self.raw.close();

        if let Some(killer) = self.killer.clone() {
            let ctx = Context::default().with_timeout(self.env.config().general.kill_timeout_duration());
            let mut conn = killer.get(&ctx).await?;
            // Boxed: exec_once can itself end up here on a deadline.
            Box::pin(conn.exec_once(&ctx, &format!("kill {}", id), 0)).await?;
        }

        Ok(())
    }

    /// Kill after the caller's deadline passed, warning if the kill itself stalls.
    async fn kill_on_deadline(&mut self, elapsed: Duration) {
        let limit = elapsed * 2 + self.env.config().general.kill_grace_duration();
        let stats = self.env.stats().clone();
        let id = self.id();

        let kill = self.kill("context deadline exceeded", elapsed);
        pin!(kill);

        let finished = select! {
            result = &mut kill => Some(result),
            _ = sleep(limit) => None,
        };

        let result = match finished {
            Some(result) => result,
            None => {
                warn!(
                    "query ID {} may be hung, kill did not finish in {}",
                    id,
                    human_duration(limit)
                );
                stats.hung_query();
                kill.await
            }
        };

        if let Err(err) = result {
            warn!("failed to kill query ID {}: {}", id, err);
        }
    }

    /// Replace the physical link.
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        self.raw.close();
        self.raw = self.connector.connect().await?;
        self.created_at = Instant::now();
        Ok(())
    }

    pub fn close(&mut self) {
        self.raw.close();
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    pub fn killed(&self) -> bool {
        self.killed.is_some()
    }

    /// Time since the connection was opened.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Time since the last query finished.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    fn ready(&self, ctx: &Context) -> Result<(), Error> {
        if let Some(err) = &self.killed {
            return Err(err.clone());
        }

        if self.raw.is_closed() {
            return Err(Error::Closed);
        }

        if ctx.expired() {
            return Err(Error::DeadlineExceeded);
        }

        Ok(())
    }

    fn retryable(&self, ctx: &Context, err: &Error) -> bool {
        err.is_conn_err() && self.killed.is_none() && !ctx.expired()
    }

    fn kill_error(&self) -> Error {
        self.killed.clone().unwrap_or(Error::Closed)
    }
}
