use thiserror::Error;

use crate::backend::{self, pool, stateful};
use crate::two_pc;

use super::State;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("{0}")]
    Backend(#[from] backend::Error),

    #[error("{0}")]
    Stateful(#[from] stateful::Error),

    #[error("{0}")]
    TwoPc(#[from] two_pc::Error),

    #[error("transaction {0}: not in a transaction")]
    NotInTransaction(i64),

    #[error("transaction {0}: cannot start a new transaction in the scope of an existing one")]
    NestedTransaction(i64),

    #[error("per-user transaction pool connection limit exceeded")]
    LimitExceeded,

    #[error("tx engine can't accept new connections in state {0}")]
    NotAccepting(State),

    #[error("2pc is not enabled")]
    TwoPcDisabled,

    #[error("{}", .0.iter().map(|err| err.to_string()).collect::<Vec<_>>().join("; "))]
    Aggregate(Vec<Error>),
}

/// Broad error class, for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Unavailable,
    ResourceExhausted,
    Aborted,
    InvalidArgument,
    FailedPrecondition,
    Canceled,
    Internal,
    Unknown,
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Self::Backend(err) => backend_code(err),
            Self::Stateful(err) => match err {
                stateful::Error::Lookup { .. } => Code::Aborted,
                stateful::Error::NotTainted(_) => Code::Internal,
                stateful::Error::Closed => Code::Unavailable,
                stateful::Error::Backend(err) => backend_code(err),
            },
            Self::TwoPc(err) => match err {
                two_pc::Error::InvalidParts(_) | two_pc::Error::InvalidTransactionId(_) => {
                    Code::InvalidArgument
                }
                two_pc::Error::ExceededLimit(_) => Code::ResourceExhausted,
                two_pc::Error::Shutdown => Code::Unavailable,
                two_pc::Error::Duplicate(_)
                | two_pc::Error::CommitState { .. }
                | two_pc::Error::Transition { .. } => Code::FailedPrecondition,
                two_pc::Error::Decode { .. } => Code::Internal,
                two_pc::Error::Backend(err) => backend_code(err),
            },
            Self::NotInTransaction(_) | Self::NestedTransaction(_) | Self::TwoPcDisabled => {
                Code::FailedPrecondition
            }
            Self::LimitExceeded => Code::ResourceExhausted,
            Self::NotAccepting(_) => Code::Unavailable,
            Self::Aggregate(errors) => errors.first().map(Self::code).unwrap_or(Code::Unknown),
        }
    }
}

fn backend_code(err: &backend::Error) -> Code {
    match err {
        backend::Error::Pool(pool::Error::CheckoutTimeout | pool::Error::WaiterCapExceeded(_)) => {
            Code::ResourceExhausted
        }
        backend::Error::Pool(pool::Error::Offline) => Code::Unavailable,
        backend::Error::Pool(pool::Error::NegativeCapacity(_)) => Code::InvalidArgument,
        backend::Error::Killed { .. } | backend::Error::DeadlineExceeded => Code::Canceled,
        backend::Error::TransactionAborted(_) | backend::Error::ConnectionAborted => Code::Aborted,
        err if err.is_conn_err() => Code::Unavailable,
        _ => Code::Unknown,
    }
}
