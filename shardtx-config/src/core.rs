use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use super::database::Database;
use super::error::Error;
use super::general::General;
use super::pooling::{TxLimiter, TxPool};
use super::two_pc::TwoPc;

/// Configuration file contents.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub database: Database,

    #[serde(default)]
    pub tx_pool: TxPool,

    #[serde(default)]
    pub tx_limiter: TxLimiter,

    #[serde(default)]
    pub two_pc: TwoPc,
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = if let Ok(contents) = read_to_string(path) {
            let config: Config = contents.parse()?;
            info!("loaded \"{}\"", path.display());
            config
        } else {
            warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Config::default()
        };

        config.check()?;

        Ok(config)
    }

    /// Reject settings the engine can't work with.
    pub fn check(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.tx_limiter.max_per_user) {
            return Err(Error::Invalid {
                name: "tx_limiter.max_per_user",
                reason: format!("{} is not between 0 and 1", self.tx_limiter.max_per_user),
            });
        }

        if self.tx_pool.timeout == 0 {
            return Err(Error::Invalid {
                name: "tx_pool.timeout",
                reason: "must be greater than zero".into(),
            });
        }

        if self.two_pc.enabled && self.tx_pool.size < 3 {
            warn!(
                "tx_pool.size is {}, prepared transactions will be limited to 1",
                self.tx_pool.size
            );
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}
