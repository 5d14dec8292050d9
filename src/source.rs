//! Contracts of the injected collaborators: the upstream change source, the
//! URI resolver, the table dumper, and the dump-info scheduler.
//!
//! All of these live outside this crate; the sink and the gateway only ever
//! see them through the traits below.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::change::{Change, Checkpoint, DumpInfo, RowChange};
use crate::Result;

/// An upstream change producer that supports committing and requeueing
/// delivered positions.
///
/// `capture(Checkpoint::default())` means "resume wherever the source
/// decides". A source is expected to re-emit the last committed transaction's
/// Begin at the stored LSN on resume; the sink's drop-filter is armed for
/// exactly that overlap.
#[async_trait]
pub trait RequeueSource: Send + Sync {
    /// Starts capturing from the given checkpoint and returns the change
    /// stream. Closing the returned channel ends the capture.
    async fn capture(&self, checkpoint: Checkpoint) -> Result<mpsc::Receiver<Change>>;

    /// Marks a delivered position as durably consumed.
    async fn commit(&self, checkpoint: Checkpoint);

    /// Asks the source to re-deliver from the given position.
    async fn requeue(&self, checkpoint: Checkpoint);

    async fn stop(&self);
}

/// Resolves a subscriber-provided URI into the source and dumper backing it.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn source(&self, uri: &str) -> Result<Arc<dyn RequeueSource>>;

    async fn dumper(&self, uri: &str) -> Result<Box<dyn SourceDumper>>;
}

/// Loads the rows of one dump assignment.
#[async_trait]
pub trait SourceDumper: Send + Sync {
    /// Resolves a dump assignment into INSERT-shaped changes. `min_lsn` is
    /// the most recent live position the session has seen; dumpers use it to
    /// avoid serving rows older than already-delivered changes.
    async fn load_dump(&self, min_lsn: u64, info: &DumpInfo) -> Result<Vec<RowChange>>;

    async fn stop(&self);
}

/// Schedules dump assignments for a session.
#[async_trait]
pub trait DumpInfoPuller: Send + Sync {
    /// Streams dump assignments for `uri`. The puller reads one value from
    /// `acks` per dispatched assignment: the empty string for success, an
    /// error message otherwise. Closing `acks` tells the puller to stop.
    async fn pull(&self, uri: &str, acks: mpsc::Receiver<String>) -> mpsc::Receiver<DumpInfo>;
}
