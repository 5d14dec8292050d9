//! Generic sink lifecycle shared by concrete sinks.
//!
//! One worker task reads changes and applies them strictly serially; there is
//! no concurrency across changes within a sink instance. The first fatal
//! handler error is recorded and stops the worker, and a clean function runs
//! whenever the worker exits, stop and abort included.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::change::{Change, Checkpoint};
use crate::{Error, Result};

#[async_trait]
pub trait SinkHandler: Send + 'static {
    /// Applies one change. Committed checkpoints go out through `committed`,
    /// one per completed transaction.
    async fn apply(
        &mut self,
        change: Change,
        committed: &mpsc::Sender<Checkpoint>,
    ) -> Result<()>;
}

/// Runs the clean function when the worker exits, no matter how.
struct CleanGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for CleanGuard {
    fn drop(&mut self) {
        if let Some(clean) = self.0.take() {
            clean();
        }
    }
}

pub struct BaseSink {
    worker: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<Arc<Error>>>>,
}

impl BaseSink {
    pub fn new() -> Self {
        Self {
            worker: None,
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns the worker. The returned channel closes once the inbound
    /// channel is drained or a fatal error stops the worker.
    pub(crate) fn spawn<H>(
        &mut self,
        mut changes: mpsc::Receiver<Change>,
        mut handler: H,
        clean: impl FnOnce() + Send + 'static,
    ) -> mpsc::Receiver<Checkpoint>
    where
        H: SinkHandler,
    {
        let (committed_tx, committed_rx) = mpsc::channel(1);
        let error = self.error.clone();

        self.worker = Some(tokio::spawn(async move {
            let _guard = CleanGuard(Some(Box::new(clean)));
            while let Some(change) = changes.recv().await {
                if let Err(err) = handler.apply(change, &committed_tx).await {
                    if let Ok(mut slot) = error.lock() {
                        slot.get_or_insert(Arc::new(err));
                    }
                    break;
                }
            }
            debug!("sink worker stopped");
        }));

        committed_rx
    }

    /// First fatal error of the worker, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Aborts the worker and waits for it to finish; the clean function runs
    /// as part of the teardown. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
    }
}

impl Default for BaseSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl SinkHandler for Echo {
        async fn apply(
            &mut self,
            change: Change,
            committed: &mpsc::Sender<Checkpoint>,
        ) -> Result<()> {
            if change.checkpoint.lsn == 99 {
                return Err(Error::IncompleteTx);
            }
            committed.send(change.checkpoint).await.ok();
            Ok(())
        }
    }

    fn change_at(lsn: u64) -> Change {
        Change {
            checkpoint: Checkpoint::from_lsn(lsn),
            message: crate::change::Message::Begin,
        }
    }

    #[tokio::test]
    async fn drains_serially_and_closes_committed_on_input_close() {
        let (tx, rx) = mpsc::channel(8);
        let mut sink = BaseSink::new();
        let mut committed = sink.spawn(rx, Echo, || {});

        for lsn in 1..=3 {
            tx.send(change_at(lsn)).await.unwrap();
        }
        drop(tx);

        assert_eq!(committed.recv().await.unwrap().lsn, 1);
        assert_eq!(committed.recv().await.unwrap().lsn, 2);
        assert_eq!(committed.recv().await.unwrap().lsn, 3);
        assert!(committed.recv().await.is_none());
        assert!(sink.error().is_none());
    }

    #[tokio::test]
    async fn fatal_error_stops_worker_and_is_surfaced() {
        let (tx, rx) = mpsc::channel(8);
        let mut sink = BaseSink::new();
        let mut committed = sink.spawn(rx, Echo, || {});

        tx.send(change_at(99)).await.unwrap();
        assert!(committed.recv().await.is_none());
        assert!(matches!(*sink.error().unwrap(), Error::IncompleteTx));
    }

    #[tokio::test]
    async fn clean_runs_on_stop() {
        let (cleaned_tx, cleaned_rx) = tokio::sync::oneshot::channel();
        let (_tx, rx) = mpsc::channel(1);
        let mut sink = BaseSink::new();
        let _committed = sink.spawn(rx, Echo, move || {
            cleaned_tx.send(()).ok();
        });

        sink.stop().await;
        cleaned_rx.await.unwrap();
    }
}
