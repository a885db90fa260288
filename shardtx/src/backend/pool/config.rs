//! Pool configuration.

use std::time::Duration;

/// Pool configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Maximum number of connections. `0` disables pooling.
    pub capacity: usize,
    /// Close idle connections after this long. Zero disables eviction.
    pub idle_timeout: Duration,
    /// Maximum number of waiting callers. `0` means no limit.
    pub max_waiters: usize,
    /// How long to wait for a connection.
    pub checkout_timeout: Duration,
}

impl Config {
    /// Transaction pool settings.
    pub fn tx_pool(config: &shardtx_config::Config) -> Self {
        Self {
            capacity: config.tx_pool.size,
            idle_timeout: config.tx_pool.idle_timeout_duration(),
            max_waiters: config.tx_pool.max_waiters,
            checkout_timeout: config.tx_pool.checkout_timeout_duration(),
        }
    }

    /// Pool used to kill running queries.
    pub fn kill_pool(config: &shardtx_config::Config) -> Self {
        Self {
            capacity: config.general.kill_pool_size,
            idle_timeout: config.tx_pool.idle_timeout_duration(),
            max_waiters: 0,
            checkout_timeout: config.general.kill_timeout_duration(),
        }
    }

    /// How often idle connections are checked.
    pub fn idle_check_interval(&self) -> Duration {
        self.idle_timeout / 10
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: 10,
            idle_timeout: Duration::from_secs(60),
            max_waiters: 0,
            checkout_timeout: Duration::from_secs(5),
        }
    }
}
