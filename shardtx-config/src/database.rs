use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::util::{env_or_default, env_string_or_default};

/// Backing database the pools connect to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Database {
    /// Database host.
    ///
    /// _Default:_ `127.0.0.1`
    #[serde(default = "Database::host")]
    pub host: String,

    /// Database port.
    ///
    /// _Default:_ `3306`
    #[serde(default = "Database::port")]
    pub port: u16,

    /// Database name.
    ///
    /// _Default:_ `shardtx`
    #[serde(default = "Database::name")]
    pub name: String,

    /// User for application connections.
    ///
    /// _Default:_ `shardtx`
    #[serde(default = "Database::user")]
    pub user: String,

    /// Password for application connections.
    #[serde(default = "Database::password")]
    pub password: String,

    /// User for the kill pool. Falls back to `user`.
    #[serde(default)]
    pub dba_user: Option<String>,

    /// Password for the kill pool. Falls back to `password`.
    #[serde(default)]
    pub dba_password: Option<String>,
}

impl Database {
    fn host() -> String {
        env_string_or_default("SHARDTX_DATABASE_HOST", "127.0.0.1")
    }

    fn port() -> u16 {
        env_or_default("SHARDTX_DATABASE_PORT", 3306)
    }

    fn name() -> String {
        env_string_or_default("SHARDTX_DATABASE_NAME", "shardtx")
    }

    fn user() -> String {
        env_string_or_default("SHARDTX_DATABASE_USER", "shardtx")
    }

    fn password() -> String {
        env_string_or_default("SHARDTX_DATABASE_PASSWORD", "")
    }

    /// User for administrative connections.
    pub fn dba_user(&self) -> &str {
        self.dba_user.as_deref().unwrap_or(&self.user)
    }

    /// Password for administrative connections.
    pub fn dba_password(&self) -> &str {
        self.dba_password.as_deref().unwrap_or(&self.password)
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            host: Self::host(),
            port: Self::port(),
            name: Self::name(),
            user: Self::user(),
            password: Self::password(),
            dba_user: None,
            dba_password: None,
        }
    }
}
