//! The capture gateway: a bidirectional streaming session that fans a live
//! change stream and asynchronously-scheduled table dumps out to one
//! subscriber, and folds the subscriber's acknowledgements back into
//! commit/requeue decisions on the upstream source.
//!
//! The transport is held behind the [`SubscriberRecv`] / [`SubscriberSend`]
//! traits; a gRPC binding is a thin adapter over a session's stream halves.
//!
//! Per-session ordering: everything delivered before a message carrying
//! checkpoint `L` belongs either to a transaction committed at or before `L`
//! or to a dump scheduled at or before that point. Live changes are forwarded
//! one message at a time; dumps are served whole between them. Dump rows
//! always carry checkpoint 0.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::change::{Change, Checkpoint, Message, RowChange};
use crate::source::{DumpInfoPuller, RequeueSource, SourceDumper, SourceResolver};
use crate::{Error, Result};

/// First message of a capture session: which source to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInit {
    pub uri: String,
}

/// Subscriber acknowledgement of one delivered message.
///
/// Checkpoint 0 acknowledges a dump row and never reaches the source. A
/// non-empty `requeue_reason` asks the source to re-deliver instead of
/// committing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureAck {
    pub checkpoint: u64,
    pub requeue_reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRequest {
    Init(CaptureInit),
    Ack(CaptureAck),
}

/// One message delivered to the subscriber. `checkpoint` is 0 for
/// dump-originated rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureMessage {
    pub checkpoint: u64,
    pub change: RowChange,
}

/// Inbound half of the subscriber stream. `Ok(None)` is a clean end of the
/// stream.
#[async_trait]
pub trait SubscriberRecv: Send + 'static {
    async fn recv(&mut self) -> Result<Option<CaptureRequest>>;
}

/// Outbound half of the subscriber stream.
#[async_trait]
pub trait SubscriberSend: Send {
    async fn send(&mut self, message: CaptureMessage) -> Result<()>;
}

pub struct Gateway<R, P> {
    resolver: R,
    puller: P,
}

impl<R, P> Gateway<R, P>
where
    R: SourceResolver,
    P: DumpInfoPuller,
{
    pub fn new(resolver: R, puller: P) -> Self {
        Self { resolver, puller }
    }

    /// Serves one capture session until the subscriber goes away, the source
    /// ends, or a send fails.
    ///
    /// The first inbound message must be [`CaptureRequest::Init`]; anything
    /// else fails with [`Error::CaptureInitRequired`].
    pub async fn capture<I, O>(&self, mut input: I, output: O) -> Result<()>
    where
        I: SubscriberRecv,
        O: SubscriberSend,
    {
        let init = match input.recv().await? {
            Some(CaptureRequest::Init(init)) => init,
            _ => return Err(Error::CaptureInitRequired),
        };
        info!(uri = %init.uri, "capture session started");

        let src = self.resolver.source(&init.uri).await?;
        let dumper = self.resolver.dumper(&init.uri).await?;

        // Checkpoint 0 lets the source resume wherever it left off. A source
        // that never entered capture is not stopped; only the dumper is.
        let result = match src.capture(Checkpoint::default()).await {
            Ok(changes) => {
                let result = self
                    .run_session(&init, input, output, src.clone(), dumper.as_ref(), changes)
                    .await;
                // Teardown mirrors session setup in reverse: the acks channel
                // is already closed when run_session returns, then the source
                // stops, then the dumper.
                src.stop().await;
                result
            }
            Err(err) => Err(err),
        };
        dumper.stop().await;
        result
    }

    async fn run_session<I, O>(
        &self,
        init: &CaptureInit,
        input: I,
        mut output: O,
        src: Arc<dyn RequeueSource>,
        dumper: &dyn SourceDumper,
        mut changes: mpsc::Receiver<Change>,
    ) -> Result<()>
    where
        I: SubscriberRecv,
        O: SubscriberSend,
    {
        let (ack_tx, ack_rx) = mpsc::channel::<String>(1);
        let mut done = acknowledge(input, src.clone());
        let mut dumps = self.puller.pull(&init.uri, ack_rx).await;
        let mut lsn = 0u64;

        loop {
            tokio::select! {
                msg = changes.recv() => {
                    let Some(change) = msg else { return Ok(()) };
                    match change.message {
                        Message::Row(row) => {
                            output
                                .send(CaptureMessage { checkpoint: change.checkpoint.lsn, change: row })
                                .await?;
                        }
                        // Bare Begin/Commit never reach the subscriber, so
                        // nobody will acknowledge them; commit right away.
                        _ => src.commit(Checkpoint::from_lsn(change.checkpoint.lsn)).await,
                    }
                    lsn = change.checkpoint.lsn;
                }
                info = dumps.recv() => {
                    let Some(info) = info else { return Ok(()) };
                    match dumper.load_dump(lsn, &info).await {
                        Ok(rows) => {
                            for row in rows {
                                output.send(CaptureMessage { checkpoint: 0, change: row }).await?;
                            }
                            ack_tx.send(String::new()).await.ok();
                        }
                        Err(err) => {
                            warn!(
                                namespace = %info.namespace,
                                table = %info.table,
                                error = %err,
                                "failed to load dump"
                            );
                            ack_tx.send(err.to_string()).await.ok();
                        }
                    }
                }
                res = &mut done => {
                    return res.unwrap_or(Ok(()));
                }
            }
        }
    }
}

/// Reads the subscriber's inbound stream and relays acknowledgements to the
/// source. Stream termination surfaces as the single value of the returned
/// channel.
fn acknowledge<I>(mut input: I, src: Arc<dyn RequeueSource>) -> oneshot::Receiver<Result<()>>
where
    I: SubscriberRecv,
{
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = loop {
            match input.recv().await {
                Err(err) => break Err(err),
                Ok(None) => break Ok(()),
                Ok(Some(CaptureRequest::Ack(ack))) => {
                    // checkpoint 0 acknowledges a dump row; nothing to relay
                    if ack.checkpoint != 0 {
                        if !ack.requeue_reason.is_empty() {
                            src.requeue(Checkpoint::from_lsn(ack.checkpoint)).await;
                        } else {
                            src.commit(Checkpoint::from_lsn(ack.checkpoint)).await;
                        }
                    }
                }
                Ok(Some(CaptureRequest::Init(_))) => {
                    debug!("ignoring init message after session start");
                }
            }
        };
        done_tx.send(result).ok();
    });
    done_rx
}
