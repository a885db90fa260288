//! Connection pool errors.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone, Copy)]
pub enum Error {
    #[error("checkout timeout")]
    CheckoutTimeout,

    #[error("too many waiters for a connection, limit is {0}")]
    WaiterCapExceeded(usize),

    #[error("pool is shut down")]
    Offline,

    #[error("capacity can't be negative: {0}")]
    NegativeCapacity(i64),
}
