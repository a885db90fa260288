//! Interface to the physical database driver.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use shardtx_config::Database;

use super::Error;

/// Rows returned by a query. Values are text, `None` is NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    /// Result of a statement that doesn't return rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Default::default()
        }
    }

    /// Result set with the given columns and rows.
    pub fn rows(fields: &[&str], rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows_affected: rows.len() as u64,
            rows,
            insert_id: 0,
        }
    }

    /// Text value at row/column.
    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|row| row.get(column))
            .and_then(|value| value.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep at most `max_rows` rows. `0` means no limit.
    pub(crate) fn truncate(mut self, max_rows: usize) -> Self {
        if max_rows > 0 {
            self.rows.truncate(max_rows);
        }
        self
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    /// Report matched rather than changed rows for updates.
    pub found_rows: bool,
}

impl ConnParams {
    /// Application connection parameters.
    pub fn app(database: &Database) -> Self {
        Self {
            host: database.host.clone(),
            port: database.port,
            dbname: database.name.clone(),
            user: database.user.clone(),
            password: database.password.clone(),
            found_rows: false,
        }
    }

    /// Administrative connection parameters, used to kill queries.
    pub fn dba(database: &Database) -> Self {
        Self {
            user: database.dba_user().to_string(),
            password: database.dba_password().to_string(),
            ..Self::app(database)
        }
    }

    /// Same parameters, negotiating found-rows semantics.
    pub fn with_found_rows(&self) -> Self {
        Self {
            found_rows: true,
            ..self.clone()
        }
    }
}

/// Callback receiving partial results of a streaming query.
pub type StreamCallback<'a> = dyn FnMut(QueryResult) -> Result<(), Error> + Send + 'a;

/// Physical link to the database.
#[async_trait]
pub trait RawConnection: Send + Debug {
    /// Server-assigned connection id, used to kill queries.
    fn id(&self) -> u64;

    /// Run a query. `max_rows` of `0` means no limit.
    async fn execute(&mut self, query: &str, max_rows: usize) -> Result<QueryResult, Error>;

    /// Run a query, delivering the result in parts. The first part
    /// carries the fields, following parts carry rows.
    async fn stream(&mut self, query: &str, callback: &mut StreamCallback<'_>)
        -> Result<(), Error>;

    /// Close the client side of the link.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Creates physical connections.
#[async_trait]
pub trait Driver: Send + Sync + Debug {
    async fn connect(&self, params: &ConnParams) -> Result<Box<dyn RawConnection>, Error>;
}

/// Driver bound to connection parameters.
#[derive(Debug, Clone)]
pub struct Connector {
    driver: Arc<dyn Driver>,
    params: ConnParams,
}

impl Connector {
    pub fn new(driver: Arc<dyn Driver>, params: ConnParams) -> Self {
        Self { driver, params }
    }

    pub async fn connect(&self) -> Result<Box<dyn RawConnection>, Error> {
        self.driver.connect(&self.params).await
    }

    pub fn params(&self) -> &ConnParams {
        &self.params
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}
