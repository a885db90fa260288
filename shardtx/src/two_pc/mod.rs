//! Two-phase commit across shards.
//!
//! Prepared transactions are held open in memory and written to a redo
//! log so they survive a restart. Distributed transaction metadata lives
//! next to it and drives recovery.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod coordinator;
pub mod dtid;
pub mod error;
pub mod executor;
pub mod prepared;
pub mod resolve;
pub mod store;
pub mod watchdog;

pub use coordinator::{Coordinator, CoordinatorSession, LocalCoordinator};
pub use dtid::Dtid;
pub use error::Error;
pub use prepared::PreparedPool;
pub use resolve::{LocalParticipants, Participants, Resolver};
pub use store::{SqlStore, TwoPcStore};

#[cfg(test)]
pub mod test;

/// State of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DtState {
    Unknown,
    Prepare,
    Commit,
    Rollback,
}

impl DtState {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Prepare => 1,
            Self::Commit => 2,
            Self::Rollback => 3,
        }
    }
}

impl TryFrom<i64> for DtState {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Unknown,
            1 => Self::Prepare,
            2 => Self::Commit,
            3 => Self::Rollback,
            value => {
                return Err(Error::Decode {
                    what: "transaction state",
                    value: value.to_string(),
                })
            }
        })
    }
}

impl Display for DtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Prepare => write!(f, "PREPARE"),
            Self::Commit => write!(f, "COMMIT"),
            Self::Rollback => write!(f, "ROLLBACK"),
        }
    }
}

/// State of a redo log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoState {
    /// Commit failed. Needs an operator.
    Failed,
    Prepared,
}

impl RedoState {
    pub fn as_i64(&self) -> i64 {
        match self {
            Self::Failed => 0,
            Self::Prepared => 1,
        }
    }
}

impl TryFrom<i64> for RedoState {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Failed),
            1 => Ok(Self::Prepared),
            value => Err(Error::Decode {
                what: "redo state",
                value: value.to_string(),
            }),
        }
    }
}

/// A participant of a distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub schema: String,
    pub shard: String,
}

impl Target {
    pub fn new(schema: impl ToString, shard: impl ToString) -> Self {
        Self {
            schema: schema.to_string(),
            shard: shard.to_string(),
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.schema, self.shard)
    }
}

/// Distributed transaction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub dtid: String,
    pub state: DtState,
    pub created: DateTime<Utc>,
    pub participants: Vec<Target>,
}

/// Redo log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTx {
    pub dtid: String,
    pub queries: Vec<String>,
    pub created: DateTime<Utc>,
}
