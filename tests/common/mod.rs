// Shared fixtures for the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_pipeline::channel::{BatchPolicy, ChannelContext, ChannelHandle, ChannelUnit, RetryPolicy};
use telemetry_pipeline::http::CallResult;
use telemetry_pipeline::{
    DelegateChain, DiscardReason, Enablement, HttpClient, HttpRequest, HttpResponse,
    IngestionContext, PendingCall, PipelineObserver, Record, SqliteLogStore,
};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DESTINATION: &str = "analytics";
pub const DEFAULT_URL: &str = "https://in.example.com";

#[derive(Default)]
pub struct CountingObserver {
    pub discarded: AtomicUsize,
    pub evicted: AtomicUsize,
    pub resets: AtomicUsize,
}

impl CountingObserver {
    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

impl PipelineObserver for CountingObserver {
    fn on_discarded(&self, _destination: &str, count: usize, _reason: DiscardReason) {
        self.discarded.fetch_add(count, Ordering::SeqCst);
    }

    fn on_evicted(&self, _destination: &str, count: usize) {
        self.evicted.fetch_add(count, Ordering::SeqCst);
    }

    fn on_store_reset(&self, _reason: &str) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Status(u16),
    /// Keep the call open until `complete_held`
    Hold,
}

pub struct RecordedCall {
    pub at: Instant,
    pub request: HttpRequest,
}

/// Scriptable client that never touches the network
pub struct FakeClient {
    reply: Mutex<Reply>,
    calls: Mutex<Vec<RecordedCall>>,
    held: Mutex<Vec<(oneshot::Sender<CallResult>, CancellationToken)>>,
    enabled: AtomicBool,
    paused: AtomicBool,
}

impl FakeClient {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|c| c.at).collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.request.url.clone())
            .collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| {
                c.request
                    .body
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Whether every held call was canceled by its owner
    pub fn held_all_canceled(&self) -> bool {
        self.held
            .lock()
            .unwrap()
            .iter()
            .all(|(_, cancel)| cancel.is_cancelled())
    }

    /// Answer every held call with `status`; returns how many there were
    pub fn complete_held(&self, status: u16) -> usize {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        let count = held.len();
        for (tx, _) in held {
            let _ = tx.send(Ok(response(status)));
        }
        count
    }
}

impl HttpClient for FakeClient {
    fn send_async(&self, request: HttpRequest) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        self.calls.lock().unwrap().push(RecordedCall {
            at: Instant::now(),
            request,
        });

        let reply = *self.reply.lock().unwrap();
        match reply {
            Reply::Status(status) => {
                let _ = tx.send(Ok(response(status)));
            }
            Reply::Hold => self.held.lock().unwrap().push((tx, cancel.clone())),
        }
        PendingCall::new(rx, cancel)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

pub fn response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        headers: BTreeMap::new(),
        body: Bytes::new(),
    }
}

pub fn event(n: usize) -> Record {
    Record::new(DESTINATION, "event", serde_json::json!({ "n": n }))
}

pub fn memory_store(observer: Arc<CountingObserver>) -> Arc<SqliteLogStore> {
    Arc::new(SqliteLogStore::open_in_memory(1000, observer).unwrap())
}

/// Timer-driven flushes are pushed far out so tests control every trigger
pub fn manual_batch_policy(max_count: usize) -> BatchPolicy {
    BatchPolicy {
        max_count,
        max_bytes: 1024 * 1024,
        flush_interval: Duration::from_secs(3600),
        pending_threshold: 1000,
    }
}

pub fn retry_policy(base_secs: u64, max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_secs(base_secs),
        max_delay: Duration::from_secs(600),
        max_retries,
    }
}

pub struct TestChannel {
    pub handle: ChannelHandle,
    pub enablement: Arc<Enablement>,
}

pub fn start_channel(
    store: Arc<SqliteLogStore>,
    client: Arc<FakeClient>,
    batch: BatchPolicy,
    retry: RetryPolicy,
    delegates: DelegateChain,
) -> TestChannel {
    let enablement = Arc::new(Enablement::new());
    enablement.configure(DESTINATION, DEFAULT_URL, true);

    let ctx = ChannelContext {
        store,
        client,
        enablement: enablement.clone(),
        ingestion: Arc::new(IngestionContext::new(None, "install-test")),
    };
    let (unit, handle) = ChannelUnit::new(DESTINATION, batch, retry, delegates, ctx);
    unit.spawn();

    TestChannel { handle, enablement }
}

/// Let spawned tasks run; instant under paused time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
