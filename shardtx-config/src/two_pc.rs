use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::util::{env_bool_or_default, env_or_default};

/// Resolver notified about abandoned distributed transactions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorKind {
    /// No watchdog.
    #[default]
    None,
    /// Resolve through this process.
    Local,
}

impl FromStr for CoordinatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid coordinator: {}", s)),
        }
    }
}

/// Two-phase commit settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TwoPc {
    /// Enable the redo log and prepared transactions.
    ///
    /// _Default:_ `false`
    #[serde(default = "TwoPc::enabled")]
    pub enabled: bool,

    /// Distributed transactions older than this are considered abandoned, in milliseconds.
    ///
    /// _Default:_ `300_000`
    #[serde(default = "TwoPc::abandon_age")]
    pub abandon_age: u64,

    /// Who resolves abandoned transactions.
    ///
    /// _Default:_ `none`
    #[serde(default = "TwoPc::coordinator")]
    pub coordinator: CoordinatorKind,
}

impl TwoPc {
    fn enabled() -> bool {
        env_bool_or_default("SHARDTX_TWO_PC_ENABLED", false)
    }

    fn abandon_age() -> u64 {
        env_or_default("SHARDTX_TWO_PC_ABANDON_AGE", 300_000)
    }

    fn coordinator() -> CoordinatorKind {
        env_or_default("SHARDTX_TWO_PC_COORDINATOR", CoordinatorKind::None)
    }

    pub fn abandon_age_duration(&self) -> Duration {
        Duration::from_millis(self.abandon_age)
    }
}

impl Default for TwoPc {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            abandon_age: Self::abandon_age(),
            coordinator: Self::coordinator(),
        }
    }
}
