//! How a transaction starts.

use std::fmt::Display;

/// Isolation requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Server default.
    #[default]
    Default,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Serializable,
    ConsistentSnapshotReadOnly,
    /// Every statement commits on its own. No BEGIN, no COMMIT.
    Autocommit,
}

impl Isolation {
    fn level(&self) -> Option<&'static str> {
        match self {
            Self::RepeatableRead => Some("repeatable read"),
            Self::ReadCommitted => Some("read committed"),
            Self::ReadUncommitted => Some("read uncommitted"),
            Self::Serializable => Some("serializable"),
            _ => None,
        }
    }

    /// Statements that open the transaction, in order.
    pub fn statements(&self, read_only: bool) -> Vec<String> {
        let begin = if read_only {
            "start transaction read only"
        } else {
            "begin"
        };

        match self {
            Self::Autocommit => vec![],
            Self::ConsistentSnapshotReadOnly => {
                vec!["start transaction with consistent snapshot, read only".into()]
            }
            Self::Default => vec![begin.into()],
            isolation => {
                let mut statements = vec![];
                if let Some(level) = isolation.level() {
                    statements.push(format!("set transaction isolation level {}", level));
                }
                statements.push(begin.into());
                statements
            }
        }
    }
}

impl Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::ConsistentSnapshotReadOnly => write!(f, "consistent snapshot, read only"),
            Self::Autocommit => write!(f, "autocommit"),
            isolation => write!(f, "{}", isolation.level().unwrap_or_default()),
        }
    }
}

/// Options for [`crate::TxEngine::begin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub isolation: Isolation,
    /// Use a connection negotiated with found-rows semantics.
    pub found_rows: bool,
}

impl TxOptions {
    pub fn new(isolation: Isolation) -> Self {
        Self {
            isolation,
            found_rows: false,
        }
    }

    pub fn with_found_rows(mut self) -> Self {
        self.found_rows = true;
        self
    }
}
