//! Capture gateway sessions driven end-to-end over channel-backed subscriber
//! streams and mock source/dumper/puller implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use pg_relay::change::{Change, Checkpoint, Commit, DumpInfo, Field, Message, Op, RowChange};
use pg_relay::gateway::{
    CaptureAck, CaptureInit, CaptureMessage, CaptureRequest, Gateway, SubscriberRecv,
    SubscriberSend,
};
use pg_relay::source::{DumpInfoPuller, RequeueSource, SourceDumper, SourceResolver};
use pg_relay::{Error, Result};

struct ChannelRecv(mpsc::Receiver<CaptureRequest>);

#[async_trait]
impl SubscriberRecv for ChannelRecv {
    async fn recv(&mut self) -> Result<Option<CaptureRequest>> {
        Ok(self.0.recv().await)
    }
}

struct ChannelSend(mpsc::Sender<CaptureMessage>);

#[async_trait]
impl SubscriberSend for ChannelSend {
    async fn send(&mut self, message: CaptureMessage) -> Result<()> {
        self.0
            .send(message)
            .await
            .map_err(|_| Error::Subscriber("subscriber went away".to_string()))
    }
}

#[derive(Default)]
struct MockSource {
    changes: Mutex<Option<mpsc::Receiver<Change>>>,
    commits: Mutex<Vec<u64>>,
    requeues: Mutex<Vec<u64>>,
    stopped: AtomicBool,
}

#[async_trait]
impl RequeueSource for MockSource {
    async fn capture(&self, _checkpoint: Checkpoint) -> Result<mpsc::Receiver<Change>> {
        self.changes
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Source("change stream unavailable".to_string()))
    }

    async fn commit(&self, checkpoint: Checkpoint) {
        self.commits.lock().unwrap().push(checkpoint.lsn);
    }

    async fn requeue(&self, checkpoint: Checkpoint) {
        self.requeues.lock().unwrap().push(checkpoint.lsn);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct MockDumper {
    rows: std::result::Result<Vec<RowChange>, String>,
    loaded_lsns: Arc<Mutex<Vec<u64>>>,
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl SourceDumper for MockDumper {
    async fn load_dump(&self, min_lsn: u64, _info: &DumpInfo) -> Result<Vec<RowChange>> {
        self.loaded_lsns.lock().unwrap().push(min_lsn);
        match &self.rows {
            Ok(rows) => Ok(rows.clone()),
            Err(message) => Err(Error::Dump(message.clone())),
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct MockResolver {
    source: Arc<MockSource>,
    dumper: Mutex<Option<Box<dyn SourceDumper>>>,
}

#[async_trait]
impl SourceResolver for MockResolver {
    async fn source(&self, _uri: &str) -> Result<Arc<dyn RequeueSource>> {
        Ok(self.source.clone())
    }

    async fn dumper(&self, _uri: &str) -> Result<Box<dyn SourceDumper>> {
        self.dumper
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Source("dumper called twice".to_string()))
    }
}

struct MockPuller {
    dumps: Mutex<Option<mpsc::Receiver<DumpInfo>>>,
    acks: mpsc::Sender<String>,
}

#[async_trait]
impl DumpInfoPuller for MockPuller {
    async fn pull(&self, _uri: &str, mut acks: mpsc::Receiver<String>) -> mpsc::Receiver<DumpInfo> {
        let dumps = self.dumps.lock().unwrap().take().expect("pull called twice");
        let forward = self.acks.clone();
        tokio::spawn(async move {
            while let Some(ack) = acks.recv().await {
                forward.send(ack).await.ok();
            }
        });
        dumps
    }
}

struct Session {
    requests: mpsc::Sender<CaptureRequest>,
    messages: mpsc::Receiver<CaptureMessage>,
    changes: mpsc::Sender<Change>,
    dumps: mpsc::Sender<DumpInfo>,
    acks: mpsc::Receiver<String>,
    source: Arc<MockSource>,
    loaded_lsns: Arc<Mutex<Vec<u64>>>,
    dumper_stopped: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

/// Spins up a gateway session with an already-sent `CaptureInit`.
fn start_session(dump_rows: std::result::Result<Vec<RowChange>, String>) -> Session {
    let (req_tx, req_rx) = mpsc::channel(8);
    let (msg_tx, msg_rx) = mpsc::channel(8);
    let (change_tx, change_rx) = mpsc::channel(8);
    let (dump_tx, dump_rx) = mpsc::channel(8);
    let (ack_tx, ack_rx) = mpsc::channel(8);

    let source = Arc::new(MockSource::default());
    *source.changes.lock().unwrap() = Some(change_rx);

    let loaded_lsns = Arc::new(Mutex::new(Vec::new()));
    let dumper_stopped = Arc::new(AtomicBool::new(false));
    let dumper = MockDumper {
        rows: dump_rows,
        loaded_lsns: loaded_lsns.clone(),
        stopped: dumper_stopped.clone(),
    };

    let resolver = MockResolver {
        source: source.clone(),
        dumper: Mutex::new(Some(Box::new(dumper))),
    };
    let puller = MockPuller {
        dumps: Mutex::new(Some(dump_rx)),
        acks: ack_tx,
    };

    let gateway = Gateway::new(resolver, puller);
    let handle = tokio::spawn(async move {
        gateway.capture(ChannelRecv(req_rx), ChannelSend(msg_tx)).await
    });

    let session = Session {
        requests: req_tx,
        messages: msg_rx,
        changes: change_tx,
        dumps: dump_tx,
        acks: ack_rx,
        source,
        loaded_lsns,
        dumper_stopped,
        handle,
    };
    session
        .requests
        .try_send(CaptureRequest::Init(CaptureInit { uri: "u".to_string() }))
        .unwrap();
    session
}

fn insert_change(lsn: u64) -> Change {
    Change {
        checkpoint: Checkpoint::from_lsn(lsn),
        message: Message::Row(insert_row("t1")),
    }
}

fn insert_row(table: &str) -> RowChange {
    RowChange {
        op: Op::Insert,
        namespace: "public".to_string(),
        table: table.to_string(),
        new_tuple: vec![Field {
            name: "id".to_string(),
            oid: 23,
            datum: Some(Bytes::from_static(&[0, 0, 0, 1])),
        }],
        old_tuple: vec![],
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn session_requires_init_first() {
    let (req_tx, req_rx) = mpsc::channel(1);
    let (msg_tx, _msg_rx) = mpsc::channel(1);
    let (ack_tx, _ack_rx) = mpsc::channel(1);

    let resolver = MockResolver {
        source: Arc::new(MockSource::default()),
        dumper: Mutex::new(None),
    };
    let puller = MockPuller {
        dumps: Mutex::new(None),
        acks: ack_tx,
    };
    let gateway = Gateway::new(resolver, puller);

    req_tx
        .try_send(CaptureRequest::Ack(CaptureAck {
            checkpoint: 1,
            requeue_reason: String::new(),
        }))
        .unwrap();

    let err = gateway
        .capture(ChannelRecv(req_rx), ChannelSend(msg_tx))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CaptureInitRequired));
}

#[tokio::test]
async fn failed_capture_stops_dumper_but_not_source() {
    let (req_tx, req_rx) = mpsc::channel(8);
    let (msg_tx, _msg_rx) = mpsc::channel(8);
    let (ack_tx, _ack_rx) = mpsc::channel(8);

    // a source with no change stream: capture() itself fails
    let source = Arc::new(MockSource::default());
    let dumper_stopped = Arc::new(AtomicBool::new(false));
    let dumper = MockDumper {
        rows: Ok(vec![]),
        loaded_lsns: Arc::new(Mutex::new(Vec::new())),
        stopped: dumper_stopped.clone(),
    };
    let resolver = MockResolver {
        source: source.clone(),
        dumper: Mutex::new(Some(Box::new(dumper))),
    };
    let puller = MockPuller {
        dumps: Mutex::new(None),
        acks: ack_tx,
    };
    let gateway = Gateway::new(resolver, puller);

    req_tx
        .try_send(CaptureRequest::Init(CaptureInit { uri: "u".to_string() }))
        .unwrap();

    let err = gateway
        .capture(ChannelRecv(req_rx), ChannelSend(msg_tx))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Source(_)));

    // the source never entered capture, so it is not stopped; the dumper is
    assert!(!source.stopped.load(Ordering::SeqCst));
    assert!(dumper_stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn forwards_row_changes_and_commits_bare_markers() {
    let mut session = start_session(Ok(vec![]));

    session
        .changes
        .send(Change {
            checkpoint: Checkpoint::from_lsn(10),
            message: Message::Begin,
        })
        .await
        .unwrap();
    session.changes.send(insert_change(11)).await.unwrap();
    session
        .changes
        .send(Change {
            checkpoint: Checkpoint::from_lsn(12),
            message: Message::Commit(Commit { commit_time: 0 }),
        })
        .await
        .unwrap();

    let message = session.messages.recv().await.unwrap();
    assert_eq!(message.checkpoint, 11);
    assert_eq!(message.change.op, Op::Insert);

    // bare Begin/Commit never reach the subscriber; they are committed
    // straight back to the source
    let source = session.source.clone();
    wait_for(
        || *source.commits.lock().unwrap() == vec![10, 12],
        "begin/commit auto-commit",
    )
    .await;

    // closing the change stream ends the session cleanly
    drop(session.changes);
    assert!(session.handle.await.unwrap().is_ok());
    assert!(session.messages.recv().await.is_none());
    assert!(session.source.stopped.load(Ordering::SeqCst));
    assert!(session.dumper_stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn ack_with_checkpoint_commits_exactly_once() {
    let session = start_session(Ok(vec![]));

    // dump acknowledgements carry checkpoint 0 and never touch the source
    session
        .requests
        .send(CaptureRequest::Ack(CaptureAck {
            checkpoint: 0,
            requeue_reason: String::new(),
        }))
        .await
        .unwrap();
    session
        .requests
        .send(CaptureRequest::Ack(CaptureAck {
            checkpoint: 11,
            requeue_reason: String::new(),
        }))
        .await
        .unwrap();

    drop(session.requests);
    assert!(session.handle.await.unwrap().is_ok());

    assert_eq!(*session.source.commits.lock().unwrap(), vec![11]);
    assert!(session.source.requeues.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ack_with_reason_requeues() {
    let session = start_session(Ok(vec![]));

    session
        .requests
        .send(CaptureRequest::Ack(CaptureAck {
            checkpoint: 11,
            requeue_reason: "busy".to_string(),
        }))
        .await
        .unwrap();

    drop(session.requests);
    assert!(session.handle.await.unwrap().is_ok());

    assert_eq!(*session.source.requeues.lock().unwrap(), vec![11]);
    assert!(session.source.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn serves_dump_rows_with_zero_checkpoint_and_acks_puller() {
    let mut session = start_session(Ok(vec![insert_row("t1"), insert_row("t1")]));

    // one live transaction first, so the dump sees the current position
    session
        .changes
        .send(Change {
            checkpoint: Checkpoint::from_lsn(10),
            message: Message::Begin,
        })
        .await
        .unwrap();
    session.changes.send(insert_change(11)).await.unwrap();
    session
        .changes
        .send(Change {
            checkpoint: Checkpoint::from_lsn(12),
            message: Message::Commit(Commit { commit_time: 0 }),
        })
        .await
        .unwrap();
    assert_eq!(session.messages.recv().await.unwrap().checkpoint, 11);
    let source = session.source.clone();
    wait_for(
        || source.commits.lock().unwrap().len() == 2,
        "live transaction drained",
    )
    .await;

    session
        .dumps
        .send(DumpInfo {
            namespace: "public".to_string(),
            table: "t1".to_string(),
            predicate: String::new(),
        })
        .await
        .unwrap();

    let first = session.messages.recv().await.unwrap();
    let second = session.messages.recv().await.unwrap();
    assert_eq!(first.checkpoint, 0);
    assert_eq!(second.checkpoint, 0);

    assert_eq!(session.acks.recv().await.unwrap(), "");
    assert_eq!(*session.loaded_lsns.lock().unwrap(), vec![12]);

    drop(session.requests);
    assert!(session.handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn failed_dump_reports_error_without_ending_session() {
    let mut session = start_session(Err("dump blew up".to_string()));

    session
        .dumps
        .send(DumpInfo {
            namespace: "public".to_string(),
            table: "t1".to_string(),
            predicate: String::new(),
        })
        .await
        .unwrap();

    let ack = session.acks.recv().await.unwrap();
    assert!(ack.contains("dump blew up"));

    // the session is still alive: live changes keep flowing
    session
        .changes
        .send(Change {
            checkpoint: Checkpoint::from_lsn(20),
            message: Message::Begin,
        })
        .await
        .unwrap();
    let source = session.source.clone();
    wait_for(
        || source.commits.lock().unwrap().contains(&20),
        "session alive after dump failure",
    )
    .await;

    drop(session.requests);
    assert!(session.handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn subscriber_send_failure_ends_session() {
    let mut session = start_session(Ok(vec![]));

    // subscriber goes away without closing the request stream
    session.messages.close();
    session.changes.send(insert_change(30)).await.unwrap();

    let err = session.handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Subscriber(_)));
}
