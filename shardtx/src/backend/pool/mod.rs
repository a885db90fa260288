//! Fixed-capacity connection pool.

pub mod config;
pub mod error;
pub mod guard;
pub mod inner;
pub mod pool_impl;
pub mod state;
pub mod waiting;

pub use config::Config;
pub use error::Error;
pub use guard::Guard;
pub use pool_impl::Pool;
pub use state::State;

use inner::{Grant, Inner, Waiter};
use guard::Reserved;
use waiting::Waiting;
