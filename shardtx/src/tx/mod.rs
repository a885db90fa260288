//! Transactions: admission, lifecycle, timeouts and the serving state machine.

pub mod engine;
pub mod error;
pub mod limiter;
pub mod options;
pub mod pool;

pub use engine::{State, TxEngine};
pub use error::{Code, Error};
pub use limiter::Limiter;
pub use options::{Isolation, TxOptions};
pub use pool::TxPool;

#[cfg(test)]
mod test;
