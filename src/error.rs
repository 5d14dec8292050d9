use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pg_try_advisory_lock failed, another process is occupying")]
    SinkOccupied,

    #[error("receive incomplete transaction")]
    IncompleteTx,

    #[error("the first request should be a CaptureInit message")]
    CaptureInitRequired,

    #[error("table {namespace}.{table} has no known key columns")]
    UnknownTable { namespace: String, table: String },

    #[error("invalid LSN: {0}")]
    InvalidLsn(String),

    #[error("checkpoint not found in server log: {0}")]
    LogScan(String),

    #[error("invalid commit timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("dump error: {0}")]
    Dump(String),

    #[error("subscriber stream error: {0}")]
    Subscriber(String),

    #[error("decode error for column {column}: {message}")]
    Decode { column: String, message: String },

    #[error("sink is not set up")]
    NotSetup,
}

pub type Result<T> = std::result::Result<T, Error>;
