//! Configuration module for pg-relay.
//!
//! Settings are loaded from environment variables following the 12-factor
//! methodology. Required variables:
//!
//! - `PG_DATABASE` - target PostgreSQL database name
//! - `PG_USERNAME` - target PostgreSQL username
//! - `PG_PASSWORD` - target PostgreSQL password
//! - `SINK_SOURCE_ID` - identifier of the upstream source, keyed into
//!   `pgcapture.sources`
//!
//! Optional variables have sensible defaults; see the struct fields.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main configuration structure.
///
/// - `postgres` - target PostgreSQL connection settings
/// - `sink` - replay sink behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub sink: SinkConfig,
}

/// Target PostgreSQL connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_secs: u64,
}

/// Replay sink behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Identifier of the upstream source; one row in `pgcapture.sources`.
    pub source_id: String,
    /// PostgreSQL server log to scan for a resume position when the sources
    /// table has none.
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a required variable is missing or a value cannot be
    /// parsed.
    pub fn from_env() -> crate::Result<Self> {
        let postgres = PostgresConfig {
            host: env::var("PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: match env::var("PG_PORT") {
                Ok(port) => port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("PG_PORT is not a valid port: {port}")))?,
                Err(_) => 5432,
            },
            database: required("PG_DATABASE")?,
            username: required("PG_USERNAME")?,
            password: required("PG_PASSWORD")?,
            connect_timeout_secs: env::var("PG_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        };

        let sink = SinkConfig {
            source_id: required("SINK_SOURCE_ID")?,
            log_path: env::var("SINK_LOG_PATH").ok().map(PathBuf::from),
        };

        Ok(Config { postgres, sink })
    }

    /// Constructs the target PostgreSQL connection URL.
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres.username,
            self.postgres.password,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database
        )
    }
}

fn required(name: &str) -> crate::Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("{name} must be set")))
}
