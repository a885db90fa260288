use thiserror::Error;

use super::DtState;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("invalid parts in dtid: {0}")]
    InvalidParts(String),

    #[error("invalid transaction id in dtid: {0}")]
    InvalidTransactionId(String),

    #[error("duplicate DTID in Prepare: {0}")]
    Duplicate(String),

    #[error("prepared transactions exceeded limit: {0}")]
    ExceededLimit(usize),

    #[error("pool is shutdown")]
    Shutdown,

    #[error("cannot commit dtid {dtid}, state: {state}")]
    CommitState { dtid: String, state: &'static str },

    #[error("could not transition to {state}: {dtid}")]
    Transition { state: DtState, dtid: String },

    #[error("unexpected {what}: {value}")]
    Decode { what: &'static str, value: String },

    #[error("{0}")]
    Backend(#[from] crate::backend::Error),
}
