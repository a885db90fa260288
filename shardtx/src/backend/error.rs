//! Backend errors.

use std::fmt::Display;

use thiserror::Error;

/// Client could not connect to the server.
pub const CR_CONNECTION_ERROR: u16 = 2002;
/// Server host is unreachable.
pub const CR_CONN_HOST_ERROR: u16 = 2003;
/// Server closed the connection.
pub const CR_SERVER_GONE_ERROR: u16 = 2006;
/// Connection dropped during a query.
pub const CR_SERVER_LOST: u16 = 2013;

/// Error returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (errno {}) (sqlstate {})",
            self.message, self.code, self.state
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{0}")]
    Sql(SqlError),

    #[error("(errno 2013) due to {reason}, elapsed time: {elapsed}, killing query ID {id}")]
    Killed {
        reason: String,
        elapsed: String,
        id: u64,
    },

    #[error("deadline exceeded before execution started")]
    DeadlineExceeded,

    #[error("connection is closed")]
    Closed,

    #[error("transaction was aborted: {0}")]
    TransactionAborted(String),

    #[error("connection was aborted")]
    ConnectionAborted,

    #[error("{0}")]
    Pool(#[from] super::pool::Error),
}

impl Error {
    pub fn sql(code: u16, state: &str, message: impl ToString) -> Self {
        Self::Sql(SqlError {
            code,
            state: state.to_string(),
            message: message.to_string(),
        })
    }

    /// Error means the connection is gone, and a fresh one might work.
    pub fn is_conn_err(&self) -> bool {
        match self {
            Self::Sql(err) => matches!(
                err.code,
                CR_CONNECTION_ERROR | CR_CONN_HOST_ERROR | CR_SERVER_GONE_ERROR | CR_SERVER_LOST
            ),
            Self::Closed => true,
            _ => false,
        }
    }

    /// The query was killed by us, not by the server.
    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed { .. })
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Sql(err) => Some(err.code),
            Self::Killed { .. } => Some(CR_SERVER_LOST),
            _ => None,
        }
    }
}
