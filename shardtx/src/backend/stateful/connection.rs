//! Connection leased for a transaction or reservation.

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::Instant;

use crate::backend::pool::Guard;
use crate::backend::{Error, QueryResult};
use crate::context::{Caller, Context};

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    Commit,
    Rollback,
    Kill,
    Prepare,
    Close,
}

impl Display for Conclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::Kill => write!(f, "kill"),
            Self::Prepare => write!(f, "prepare"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// Transaction metadata.
#[derive(Debug, Clone)]
pub struct TxProperties {
    pub caller: Caller,
    pub started: Instant,
    pub started_at: DateTime<Local>,
    /// Statements that changed data, in order.
    pub queries: Vec<String>,
    pub autocommit: bool,
    pub read_only: bool,
    pub conclusion: Option<Conclusion>,
    /// Holds a limiter slot.
    pub limited: bool,
}

impl TxProperties {
    pub fn new(caller: &Caller, autocommit: bool, read_only: bool) -> Self {
        Self {
            caller: caller.clone(),
            started: Instant::now(),
            started_at: Local::now(),
            queries: vec![],
            autocommit,
            read_only,
            conclusion: None,
            limited: false,
        }
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Reservation metadata.
#[derive(Debug, Clone)]
pub struct ReservedProperties {
    pub caller: Caller,
    pub started: Instant,
}

/// Connection plus the state that keeps it out of general circulation.
#[derive(Debug)]
pub struct StatefulConnection {
    id: i64,
    conn: Guard,
    tx_props: Option<TxProperties>,
    reserved_props: Option<ReservedProperties>,
    tainted: bool,
}

impl StatefulConnection {
    pub(super) fn new(id: i64, conn: Guard) -> Self {
        Self {
            id,
            conn,
            tx_props: None,
            reserved_props: None,
            tainted: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub(super) fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    /// Id of the physical connection.
    pub fn conn_id(&self) -> u64 {
        self.conn.id()
    }

    /// Execute a query. Never reconnects: a lost connection means a lost transaction.
    pub async fn exec(
        &mut self,
        ctx: &Context,
        query: &str,
        max_rows: usize,
    ) -> Result<QueryResult, Error> {
        if self.is_closed() && !self.conn.killed() {
            return Err(match self.tx_props.as_ref().and_then(|props| props.conclusion) {
                Some(conclusion) => Error::TransactionAborted(conclusion.to_string()),
                None if self.is_in_transaction() => Error::TransactionAborted("closed".into()),
                None => Error::ConnectionAborted,
            });
        }

        self.conn.exec_once(ctx, query, max_rows).await
    }

    /// Kill whatever is running and close the connection.
    pub async fn kill(&mut self, reason: &str, elapsed: Duration) -> Result<(), Error> {
        self.conn.kill(reason, elapsed).await
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub fn current(&self) -> Option<&str> {
        self.conn.current()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.tx_props.is_some()
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Take the connection out of pool circulation for use across calls.
    pub fn taint(&mut self, caller: &Caller) {
        if self.tainted {
            return;
        }
        self.conn.taint();
        self.tainted = true;
        self.reserved_props = Some(ReservedProperties {
            caller: caller.clone(),
            started: Instant::now(),
        });
    }

    pub fn tx_props(&self) -> Option<&TxProperties> {
        self.tx_props.as_ref()
    }

    pub fn tx_props_mut(&mut self) -> Option<&mut TxProperties> {
        self.tx_props.as_mut()
    }

    pub fn set_tx_props(&mut self, props: TxProperties) {
        self.tx_props = Some(props);
    }

    pub fn take_tx_props(&mut self) -> Option<TxProperties> {
        self.tx_props.take()
    }

    pub fn reserved_props(&self) -> Option<&ReservedProperties> {
        self.reserved_props.as_ref()
    }

    /// Remember a statement for the redo log.
    pub fn record_query(&mut self, query: &str) {
        if let Some(props) = self.tx_props.as_mut() {
            props.queries.push(query.to_string());
        }
    }

    /// Who owns this connection.
    pub fn caller(&self) -> Option<&Caller> {
        self.tx_props
            .as_ref()
            .map(|props| &props.caller)
            .or(self.reserved_props.as_ref().map(|props| &props.caller))
    }
}
