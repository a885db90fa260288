//! Transactional core of a sharded database proxy.
//!
//! Leases physical connections, tracks which ones are inside a transaction,
//! limits concurrent transactions per caller, rolls back abandoned
//! transactions and drives two-phase commit across shards.

pub mod backend;
pub mod context;
pub mod env;
pub mod stats;
pub mod ticker;
pub mod tx;
pub mod two_pc;
pub mod util;


pub use context::{Caller, Context};
pub use env::Env;
pub use tx::TxEngine;

use std::io::IsTerminal;
use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static LOGGER: Once = Once::new();

/// Install the log subscriber. Safe to call more than once.
pub fn logger() {
    LOGGER.call_once(|| {
        let format = fmt::layer()
            .with_ansi(std::io::stderr().is_terminal())
            .with_file(false);

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();

        // Another subscriber may already be installed by the embedding process.
        let _ = tracing_subscriber::registry()
            .with(format)
            .with(filter)
            .try_init();
    });
}
