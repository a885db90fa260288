//! Shared configuration and counters handed to every component.

use std::sync::Arc;

use shardtx_config::Config;

use crate::stats::Stats;

/// Constructed once at startup and cloned into every component.
#[derive(Debug, Clone, Default)]
pub struct Env {
    config: Arc<Config>,
    stats: Arc<Stats>,
}

impl Env {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}
