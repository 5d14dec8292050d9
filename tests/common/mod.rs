use pg_relay::config::{Config, PostgresConfig, SinkConfig};
use std::env;

/// Test configuration from `TEST_PG_*` environment variables, with defaults
/// matching a stock local PostgreSQL.
pub fn get_test_config() -> Config {
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
    };

    let sink = SinkConfig {
        source_id: "repl_test".to_string(),
        log_path: None,
    };

    Config { postgres, sink }
}
