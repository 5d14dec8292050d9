pub mod base;
pub mod postgres;

pub use base::{BaseSink, SinkHandler};
pub use postgres::PgSink;
