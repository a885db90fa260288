//! Configuration for the transactional core.
//!
//! Every section deserializes from TOML with defaults that can be
//! overridden through `SHARDTX_*` environment variables.

pub mod core;
pub mod database;
pub mod error;
pub mod general;
pub mod pooling;
pub mod two_pc;
pub mod util;

pub use core::Config;
pub use database::Database;
pub use error::Error;
pub use general::General;
pub use pooling::{TxLimiter, TxPool};
pub use two_pc::{CoordinatorKind, TwoPc};
