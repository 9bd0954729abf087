use serde::Deserialize;

use crate::TASK_DURATION_SECS;

/// Where balances and records are kept.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub ledger_backend: LedgerBackend,
    pub task_duration_secs: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000_i64)?
            .set_default("db_max_connections", 8_i64)?
            .set_default("ledger_backend", "postgres")?
            .set_default("task_duration_secs", i64::from(TASK_DURATION_SECS))?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}
