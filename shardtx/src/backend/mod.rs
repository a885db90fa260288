//! Physical connections and the pools that lease them.

pub mod connection;
pub mod driver;
pub mod error;
pub mod memory;
pub mod pool;
pub mod stateful;

pub use connection::Connection;
pub use driver::{ConnParams, Connector, Driver, QueryResult, RawConnection};
pub use error::{Error, SqlError};
pub use memory::MemoryDb;
pub use pool::Pool;
pub use stateful::{StatefulConnection, StatefulConnectionPool};
