//! Test doubles shared by the unit tests.

use crate::catalog::TradingPairCatalog;
use crate::connection::{Connector, FrameReader, FrameWriter};
use crate::error::Error;
use crate::handler::VenueHandler;
use crate::snapshot::SnapshotEndpoint;
use crate::types::{StreamKind, TradingPair};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// Poll `cond` until it holds, advancing (paused) time in small steps.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(600);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Venue speaking the default JSON dialect with explicit (un)subscribe frames.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TestVenue;

impl VenueHandler for TestVenue {
    async fn stream_url(&self, kind: StreamKind) -> String {
        format!("wss://venue.test/{}", kind)
    }

    fn subscription_message(&self, kind: StreamKind, pairs: &[TradingPair]) -> Option<String> {
        Some(json!({"type": "subscribe", "channel": kind.as_str(), "pairs": pairs}).to_string())
    }

    fn unsubscription_message(&self, kind: StreamKind, pairs: &[TradingPair]) -> Option<String> {
        Some(json!({"type": "unsubscribe", "channel": kind.as_str(), "pairs": pairs}).to_string())
    }
}

enum MockFrame {
    Text(String),
    Undecodable,
    End,
    Fail,
}

enum Script {
    EndImmediately,
    FailImmediately,
    Refuse,
    ConnectError(Error),
}

/// One fake connection opened by [`MockConnector`].
pub(crate) struct MockConnection {
    pub(crate) url: String,
    frames: mpsc::UnboundedSender<MockFrame>,
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
    open: AtomicBool,
    stalled: AtomicBool,
}

impl MockConnection {
    pub(crate) fn push_text(&self, text: String) {
        let _ = self.frames.send(MockFrame::Text(text));
    }

    /// A binary frame that is not valid UTF-8
    pub(crate) fn push_undecodable(&self) {
        let _ = self.frames.send(MockFrame::Undecodable);
    }

    /// The next read fails as if the socket was reset
    pub(crate) fn fail(&self) {
        let _ = self.frames.send(MockFrame::Fail);
    }

    /// Writes and closes never complete from now on
    pub(crate) fn stall_writes(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    /// Remote end closes the stream
    pub(crate) fn end(&self) {
        let _ = self.frames.send(MockFrame::End);
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn ping_count(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.contains("\"type\":\"ping\""))
            .count()
    }

    /// Pairs of the first subscription frame sent on this connection
    pub(crate) fn subscribed_pairs(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(f).ok())
            .find(|v| v["type"] == "subscribe")
            .and_then(|v| {
                v["pairs"].as_array().map(|pairs| {
                    pairs
                        .iter()
                        .filter_map(|p| p.as_str().map(str::to_string))
                        .collect()
                })
            })
            .unwrap_or_default()
    }
}

/// Connector handing out in-memory connections, scriptable per attempt.
#[derive(Default)]
pub(crate) struct MockConnector {
    attempts: AtomicUsize,
    scripts: Mutex<VecDeque<Script>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next connection ends as soon as it is read
    pub(crate) fn script_end_immediately(&self) {
        self.scripts.lock().push_back(Script::EndImmediately);
    }

    /// The next connection's first read fails
    pub(crate) fn script_fail_immediately(&self) {
        self.scripts.lock().push_back(Script::FailImmediately);
    }

    /// The next connect attempt fails with `error`
    pub(crate) fn script_connect_error(&self, error: Error) {
        self.scripts.lock().push_back(Script::ConnectError(error));
    }

    pub(crate) fn refuse_next_connects(&self, n: usize) {
        let mut scripts = self.scripts.lock();
        for _ in 0..n {
            scripts.push_back(Script::Refuse);
        }
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock()[index].clone()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    /// Connections not yet closed
    pub(crate) fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.close_count() == 0)
            .count()
    }
}

impl Connector for MockConnector {
    type Writer = MockWriter;
    type Reader = MockReader;

    async fn connect(&self, url: &str) -> Result<(MockWriter, MockReader), Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front();

        let (tx, rx) = mpsc::unbounded_channel();
        match script {
            Some(Script::Refuse) => {
                return Err(Error::ConnectionFailed("connection refused".to_string()));
            }
            Some(Script::ConnectError(error)) => return Err(error),
            Some(Script::EndImmediately) => {
                let _ = tx.send(MockFrame::End);
            }
            Some(Script::FailImmediately) => {
                let _ = tx.send(MockFrame::Fail);
            }
            None => {}
        }

        let conn = Arc::new(MockConnection {
            url: url.to_string(),
            frames: tx,
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
        });
        self.connections.lock().push(conn.clone());

        Ok((MockWriter { conn }, MockReader { frames: rx }))
    }
}

pub(crate) struct MockWriter {
    conn: Arc<MockConnection>,
}

impl FrameWriter for MockWriter {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        if self.conn.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if !self.conn.open.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("connection closed".to_string()));
        }
        self.conn.sent.lock().push(text);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.open.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.conn.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.conn.open.store(false, Ordering::SeqCst);
        self.conn.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockReader {
    frames: mpsc::UnboundedReceiver<MockFrame>,
}

impl FrameReader for MockReader {
    async fn next_frame(&mut self) -> Option<Result<String, Error>> {
        match self.frames.recv().await? {
            MockFrame::Text(text) => Some(Ok(text)),
            MockFrame::Undecodable => Some(Err(Error::Decode(
                "binary frame: invalid utf-8 sequence".to_string(),
            ))),
            MockFrame::End => None,
            MockFrame::Fail => Some(Err(Error::ConnectionFailed("connection reset".to_string()))),
        }
    }
}

/// Catalog with a mutable pair list and injectable failures.
pub(crate) struct MockCatalog {
    pairs: Mutex<Vec<TradingPair>>,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl MockCatalog {
    pub(crate) fn new(pairs: &[&str]) -> Self {
        Self {
            pairs: Mutex::new(pairs.iter().map(|p| TradingPair::from(*p)).collect()),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_pairs(&self, pairs: &[&str]) {
        *self.pairs.lock() = pairs.iter().map(|p| TradingPair::from(*p)).collect();
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TradingPairCatalog for MockCatalog {
    async fn list_active(&self) -> Result<Vec<TradingPair>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Catalog("catalog unavailable".to_string()));
        }
        Ok(self.pairs.lock().clone())
    }
}

/// Snapshot endpoint returning canned books; selected pairs fail.
#[derive(Default)]
pub(crate) struct MockSnapshots {
    failing: Mutex<HashSet<TradingPair>>,
    requests: Mutex<Vec<(TradingPair, Instant)>>,
}

impl MockSnapshots {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_pair(&self, pair: &str) {
        self.failing.lock().insert(TradingPair::from(pair));
    }

    pub(crate) fn requests(&self) -> Vec<(TradingPair, Instant)> {
        self.requests.lock().clone()
    }

    pub(crate) fn requested_pairs(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|(p, _)| p.to_string())
            .collect()
    }
}

#[async_trait]
impl SnapshotEndpoint for MockSnapshots {
    async fn get(&self, pair: &TradingPair) -> Result<Value, Error> {
        self.requests.lock().push((pair.clone(), Instant::now()));
        if self.failing.lock().contains(pair) {
            return Err(Error::HttpStatus {
                status: 500,
                url: format!("https://venue.test/depth/{}", pair),
            });
        }
        Ok(json!({"symbol": pair.as_str(), "lastUpdateId": 100, "bids": [], "asks": []}))
    }
}

/// Serve one canned HTTP response on a local port.
///
/// Returns the base URL and a task yielding the raw request that was received.
pub(crate) async fn serve_once(
    status: u16,
    body: &str,
) -> (String, tokio::task::JoinHandle<String>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = format!(
        "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        String::from_utf8_lossy(&request).into_owned()
    });

    (format!("http://{}", addr), server)
}
