//! # pg-relay
//!
//! Replays a PostgreSQL primary's logical-replication changes into a second
//! PostgreSQL instance and fans the same stream out to checkpointed
//! subscribers, with on-demand bulk "dump" reloads of individual tables.
//!
//! ## Overview
//!
//! Two subsystems share one data model:
//!
//! - The **replay sink** consumes an ordered Begin/Change/Commit stream,
//!   reproduces each transaction against the target database with binary
//!   parameter binding driven by the original column OIDs, tracks the last
//!   durably-applied WAL position, and refreshes its primary-key cache after
//!   in-band DDL.
//! - The **capture gateway** serves a long-lived bidirectional streaming
//!   session per subscriber, merging live changes with scheduled table dumps
//!   and folding acknowledgements back into commit/requeue decisions on the
//!   upstream source.
//!
//! ## Quick start (sink)
//!
//! ```rust,no_run
//! use pg_relay::{Config, PgSink, Result};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!
//!     let mut sink = PgSink::new(config.postgres_url(), config.sink.clone());
//!     let checkpoint = sink.setup().await?;
//!     println!("resuming from {}", pg_relay::format_lsn(checkpoint.lsn));
//!
//!     // `changes` is fed by the upstream logical-decoding reader.
//!     let (_changes_tx, changes_rx) = mpsc::channel(64);
//!     let mut committed = sink.apply(changes_rx)?;
//!     while let Some(cp) = committed.recv().await {
//!         println!("committed {}", pg_relay::format_lsn(cp.lsn));
//!     }
//!
//!     sink.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Resume semantics
//!
//! The sink stores the last committed position in `pgcapture.sources` inside
//! the same transaction as the replayed changes, so a restart resumes exactly
//! once: the re-emitted transaction at the stored position is dropped by the
//! sink's LSN filter and everything after it applies normally. When the
//! sources table has no row yet, the sink can optionally recover a position
//! from the PostgreSQL server log.
//!
//! Exactly one sink may replay into a database at a time; setup takes an
//! advisory lock keyed on the database name and fails fast when another
//! process holds it.
//!
//! ## Architecture
//!
//! - [`change`] - checkpoints, changes, tuples, and LSN helpers
//! - [`config`] - configuration structures and environment parsing
//! - [`error`] - error types and result handling
//! - [`schema`] - the target database's primary-key cache
//! - [`sink`] - the base sink lifecycle and the PostgreSQL replay sink
//! - [`source`] - contracts of the injected source, dumper, and scheduler
//! - [`gateway`] - the capture session server
//! - [`model`] - typed-row decoding for downstream consumers

/// Checkpoints, changes, tuples, and LSN helpers
pub mod change;

/// Configuration structures and environment variable parsing
pub mod config;

/// Error types and result handling
pub mod error;

/// The capture session server
pub mod gateway;

/// Typed-row decoding registry
pub mod model;

/// Primary-key cache over the target database's catalog
pub mod schema;

/// Sink lifecycle and the PostgreSQL replay sink
pub mod sink;

/// Contracts of the injected collaborators
pub mod source;

pub use change::{format_lsn, parse_lsn, Change, Checkpoint, Field, Message, Op, RowChange};
pub use config::Config;
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use schema::SchemaLoader;
pub use sink::PgSink;
