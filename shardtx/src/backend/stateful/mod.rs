//! Leased connections carrying transaction state, and the registry that owns them.

pub mod connection;
pub mod error;
pub mod pool;
pub mod registry;

pub use connection::{Conclusion, ReservedProperties, StatefulConnection, TxProperties};
pub use error::Error;
pub use pool::StatefulConnectionPool;

use registry::Registry;

#[cfg(test)]
mod test;
