//! Scripted in-memory database.
//!
//! Answers queries from a table of canned results, can be told to fail,
//! stall or refuse connections, and keeps a log of everything it ran.
//! `kill <id>` marks the target connection as lost.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::sleep;

use super::driver::{ConnParams, Driver, QueryResult, RawConnection, StreamCallback};
use super::error::{CR_CONN_HOST_ERROR, CR_SERVER_GONE_ERROR, CR_SERVER_LOST};
use super::Error;

static KILL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*kill\s+(?:query\s+)?(\d+)\s*$").unwrap()
});

#[derive(Debug, Clone)]
struct Rejection {
    error: Error,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    exact: HashMap<String, QueryResult>,
    patterns: Vec<(Regex, QueryResult)>,
    rejections: HashMap<String, Rejection>,
    delays: HashMap<String, Duration>,
    stream_failures: HashMap<String, usize>,
    log: Vec<(u64, String)>,
    killed: HashSet<u64>,
    connections: Vec<ConnParams>,
    refuse: bool,
    strict: bool,
}

impl Inner {
    fn result(&self, query: &str) -> Option<QueryResult> {
        if let Some(result) = self.exact.get(query) {
            return Some(result.clone());
        }

        self.patterns
            .iter()
            .find(|(pattern, _)| pattern.is_match(query))
            .map(|(_, result)| result.clone())
    }

    fn rejection(&mut self, query: &str) -> Option<Error> {
        let rejection = self.rejections.get_mut(query)?;
        let error = rejection.error.clone();

        if let Some(remaining) = rejection.remaining.as_mut() {
            if *remaining <= 1 {
                self.rejections.remove(query);
            } else {
                *remaining -= 1;
            }
        }

        Some(error)
    }
}

/// In-memory database and its driver.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `query` with `result`.
    pub fn add_query(&self, query: &str, result: QueryResult) {
        self.inner.lock().exact.insert(query.to_string(), result);
    }

    /// Answer queries matching `pattern` with `result`. Exact queries take precedence.
    pub fn add_query_pattern(&self, pattern: &str, result: QueryResult) -> Result<(), regex::Error> {
        let regex = Regex::new(pattern)?;
        self.inner.lock().patterns.push((regex, result));
        Ok(())
    }

    /// Fail `query` with `error`, `times` times or forever.
    pub fn reject(&self, query: &str, error: Error, times: Option<usize>) {
        self.inner.lock().rejections.insert(
            query.to_string(),
            Rejection {
                error,
                remaining: times,
            },
        );
    }

    /// Stop failing `query`.
    pub fn accept(&self, query: &str) {
        self.inner.lock().rejections.remove(query);
    }

    /// Make `query` take `delay` before answering.
    pub fn delay(&self, query: &str, delay: Duration) {
        self.inner.lock().delays.insert(query.to_string(), delay);
    }

    /// Drop the connection after `rows` rows of a streamed `query`, once.
    pub fn fail_stream_after(&self, query: &str, rows: usize) {
        self.inner
            .lock()
            .stream_failures
            .insert(query.to_string(), rows);
    }

    /// Refuse new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse = refuse;
    }

    /// Unknown queries fail instead of returning an empty result.
    pub fn strict(&self, strict: bool) {
        self.inner.lock().strict = strict;
    }

    /// Drop the server side of a connection.
    pub fn disconnect(&self, id: u64) {
        self.inner.lock().killed.insert(id);
    }

    /// Every query run so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.inner.lock().log.iter().map(|(_, q)| q.clone()).collect()
    }

    /// Queries run on one connection, in order.
    pub fn queries_for(&self, id: u64) -> Vec<String> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|(conn, _)| *conn == id)
            .map(|(_, q)| q.clone())
            .collect()
    }

    /// Number of times `query` was run.
    pub fn count(&self, query: &str) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|(_, q)| q == query)
            .count()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    /// Connections killed or dropped server-side.
    pub fn killed(&self) -> Vec<u64> {
        let mut killed: Vec<_> = self.inner.lock().killed.iter().copied().collect();
        killed.sort();
        killed
    }

    /// Parameters of every connection opened so far.
    pub fn connections(&self) -> Vec<ConnParams> {
        self.inner.lock().connections.clone()
    }

    fn lost() -> Error {
        Error::sql(
            CR_SERVER_LOST,
            "HY000",
            "Lost connection to MySQL server during query",
        )
    }

    /// Run everything up to producing the result.
    async fn run(&self, id: u64, query: &str) -> Result<QueryResult, Error> {
        let delay = {
            let mut guard = self.inner.lock();
            if guard.killed.contains(&id) {
                return Err(Self::lost());
            }
            guard.log.push((id, query.to_string()));
            guard.delays.get(query).copied()
        };

        if let Some(delay) = delay {
            sleep(delay).await;
        }

        let mut guard = self.inner.lock();
        if guard.killed.contains(&id) {
            return Err(Self::lost());
        }

        if let Some(captures) = KILL.captures(query) {
            if let Some(target) = captures.get(1).and_then(|m| m.as_str().parse().ok()) {
                guard.killed.insert(target);
            }
            return Ok(QueryResult::default());
        }

        if let Some(error) = guard.rejection(query) {
            return Err(error);
        }

        match guard.result(query) {
            Some(result) => Ok(result),
            None if guard.strict => Err(Error::sql(
                1064,
                "42000",
                format!("query not supported: {}", query),
            )),
            None => Ok(QueryResult::default()),
        }
    }
}

#[async_trait]
impl Driver for MemoryDb {
    async fn connect(&self, params: &ConnParams) -> Result<Box<dyn RawConnection>, Error> {
        let mut guard = self.inner.lock();
        if guard.refuse {
            return Err(Error::sql(
                CR_CONN_HOST_ERROR,
                "HY000",
                format!("Can't connect to MySQL server on '{}'", params.host),
            ));
        }

        guard.next_id += 1;
        guard.connections.push(params.clone());

        Ok(Box::new(MemoryConnection {
            id: guard.next_id,
            db: self.clone(),
            closed: false,
        }))
    }
}

/// Connection to a [`MemoryDb`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    db: MemoryDb,
    closed: bool,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), Error> {
        if self.closed {
            Err(Error::sql(
                CR_SERVER_GONE_ERROR,
                "HY000",
                "MySQL server has gone away",
            ))
        } else {
            Ok(())
        }
    }

    fn lost(&mut self, err: Error) -> Error {
        if err.is_conn_err() {
            self.closed = true;
        }
        err
    }
}

#[async_trait]
impl RawConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn execute(&mut self, query: &str, max_rows: usize) -> Result<QueryResult, Error> {
        self.check()?;
        match self.db.run(self.id, query).await {
            Ok(result) => Ok(result.truncate(max_rows)),
            Err(err) => Err(self.lost(err)),
        }
    }

    async fn stream(
        &mut self,
        query: &str,
        callback: &mut StreamCallback<'_>,
    ) -> Result<(), Error> {
        self.check()?;
        let result = match self.db.run(self.id, query).await {
            Ok(result) => result,
            Err(err) => return Err(self.lost(err)),
        };

        let fail_after = self.db.inner.lock().stream_failures.remove(query);

        callback(QueryResult {
            fields: result.fields.clone(),
            ..Default::default()
        })?;

        for (sent, row) in result.rows.into_iter().enumerate() {
            if fail_after == Some(sent) {
                self.closed = true;
                return Err(MemoryDb::lost());
            }

            callback(QueryResult {
                rows: vec![row],
                ..Default::default()
            })?;
        }

        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
