use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::env_or_default;

/// Settings that apply to the whole engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// How long a graceful shutdown waits for open transactions, in milliseconds.
    /// `0` waits until every transaction finishes.
    ///
    /// _Default:_ `3_000`
    #[serde(default = "General::shutdown_grace_period")]
    pub shutdown_grace_period: u64,

    /// Connections reserved for killing running queries.
    ///
    /// _Default:_ `3`
    #[serde(default = "General::kill_pool_size")]
    pub kill_pool_size: usize,

    /// How long a single kill may take, in milliseconds.
    ///
    /// _Default:_ `1_000`
    #[serde(default = "General::kill_timeout")]
    pub kill_timeout: u64,

    /// Extra time a kill may take before the query is reported as hung, in milliseconds.
    ///
    /// _Default:_ `5_000`
    #[serde(default = "General::kill_grace")]
    pub kill_grace: u64,

    /// Number of recently ended transactions remembered for error messages.
    ///
    /// _Default:_ `1024`
    #[serde(default = "General::ended_cache_size")]
    pub ended_cache_size: usize,
}

impl General {
    fn shutdown_grace_period() -> u64 {
        env_or_default("SHARDTX_SHUTDOWN_GRACE_PERIOD", 3_000)
    }

    fn kill_pool_size() -> usize {
        env_or_default("SHARDTX_KILL_POOL_SIZE", 3)
    }

    fn kill_timeout() -> u64 {
        env_or_default("SHARDTX_KILL_TIMEOUT", 1_000)
    }

    fn kill_grace() -> u64 {
        env_or_default("SHARDTX_KILL_GRACE", 5_000)
    }

    fn ended_cache_size() -> usize {
        env_or_default("SHARDTX_ENDED_CACHE_SIZE", 1024)
    }

    pub fn shutdown_grace_period_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period)
    }

    pub fn kill_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.kill_timeout)
    }

    pub fn kill_grace_duration(&self) -> Duration {
        Duration::from_millis(self.kill_grace)
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Self::shutdown_grace_period(),
            kill_pool_size: Self::kill_pool_size(),
            kill_timeout: Self::kill_timeout(),
            kill_grace: Self::kill_grace(),
            ended_cache_size: Self::ended_cache_size(),
        }
    }
}
