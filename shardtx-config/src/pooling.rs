use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::{env_bool_or_default, env_or_default};

/// Transaction pool settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TxPool {
    /// Maximum number of connections used for transactions.
    ///
    /// _Default:_ `20`
    #[serde(default = "TxPool::size")]
    pub size: usize,

    /// Transactions idle for longer than this are rolled back, in milliseconds.
    ///
    /// _Default:_ `30_000`
    #[serde(default = "TxPool::timeout")]
    pub timeout: u64,

    /// Idle connections are closed after this many milliseconds. `0` disables eviction.
    ///
    /// _Default:_ `1_800_000`
    #[serde(default = "TxPool::idle_timeout")]
    pub idle_timeout: u64,

    /// Maximum number of callers waiting for a connection. `0` means no limit.
    ///
    /// _Default:_ `5000`
    #[serde(default = "TxPool::max_waiters")]
    pub max_waiters: usize,

    /// How long a caller waits for a connection before giving up, in milliseconds.
    ///
    /// _Default:_ `5_000`
    #[serde(default = "TxPool::checkout_timeout")]
    pub checkout_timeout: u64,
}

impl TxPool {
    fn size() -> usize {
        env_or_default("SHARDTX_TX_POOL_SIZE", 20)
    }

    fn timeout() -> u64 {
        env_or_default("SHARDTX_TX_POOL_TIMEOUT", 30_000)
    }

    fn idle_timeout() -> u64 {
        env_or_default("SHARDTX_TX_POOL_IDLE_TIMEOUT", 1_800_000)
    }

    fn max_waiters() -> usize {
        env_or_default("SHARDTX_TX_POOL_MAX_WAITERS", 5000)
    }

    fn checkout_timeout() -> u64 {
        env_or_default("SHARDTX_TX_POOL_CHECKOUT_TIMEOUT", 5_000)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    pub fn checkout_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout)
    }
}

impl Default for TxPool {
    fn default() -> Self {
        Self {
            size: Self::size(),
            timeout: Self::timeout(),
            idle_timeout: Self::idle_timeout(),
            max_waiters: Self::max_waiters(),
            checkout_timeout: Self::checkout_timeout(),
        }
    }
}

/// Per-caller transaction limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TxLimiter {
    /// Enforce per-caller limits.
    ///
    /// _Default:_ `false`
    #[serde(default = "TxLimiter::enabled")]
    pub enabled: bool,

    /// Count but never reject.
    ///
    /// _Default:_ `false`
    #[serde(default = "TxLimiter::dry_run")]
    pub dry_run: bool,

    /// Fraction of the transaction pool a single caller may hold.
    ///
    /// _Default:_ `0.4`
    #[serde(default = "TxLimiter::max_per_user")]
    pub max_per_user: f64,

    /// Include the caller's username in the limiter key.
    ///
    /// _Default:_ `true`
    #[serde(default = "TxLimiter::by_username")]
    pub by_username: bool,

    /// Include the caller's host in the limiter key.
    ///
    /// _Default:_ `false`
    #[serde(default = "TxLimiter::by_host")]
    pub by_host: bool,
}

impl TxLimiter {
    fn enabled() -> bool {
        env_bool_or_default("SHARDTX_TX_LIMITER_ENABLED", false)
    }

    fn dry_run() -> bool {
        env_bool_or_default("SHARDTX_TX_LIMITER_DRY_RUN", false)
    }

    fn max_per_user() -> f64 {
        env_or_default("SHARDTX_TX_LIMITER_MAX_PER_USER", 0.4)
    }

    fn by_username() -> bool {
        env_bool_or_default("SHARDTX_TX_LIMITER_BY_USERNAME", true)
    }

    fn by_host() -> bool {
        env_bool_or_default("SHARDTX_TX_LIMITER_BY_HOST", false)
    }
}

impl Default for TxLimiter {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            dry_run: Self::dry_run(),
            max_per_user: Self::max_per_user(),
            by_username: Self::by_username(),
            by_host: Self::by_host(),
        }
    }
}
