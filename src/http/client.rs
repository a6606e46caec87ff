// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// reqwest-backed delivery client

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::Client;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{CallResult, HttpRequest, HttpResponse, PendingCall};
use super::HttpClient;
use crate::config::HttpConfig;
use crate::error::DeliveryError;

struct QueuedCall {
    id: u64,
    request: HttpRequest,
    tx: oneshot::Sender<CallResult>,
    cancel: CancellationToken,
}

struct ClientState {
    enabled: bool,
    paused: bool,
    queued: VecDeque<QueuedCall>,
    next_id: u64,
}

struct Shared {
    state: Mutex<ClientState>,
    in_flight: DashMap<u64, CancellationToken>,
}

/// Delivery client on top of a pooled reqwest client
pub struct ReqwestHttpClient {
    client: Client,
    timeout: Duration,
    // gzip bodies of at least this many bytes
    compression_threshold: Option<usize>,
    shared: Arc<Shared>,
}

impl ReqwestHttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(config.max_connections_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            timeout: config.timeout(),
            compression_threshold: config
                .compression
                .then_some(config.compression_threshold_bytes),
            shared: Arc::new(Shared {
                state: Mutex::new(ClientState {
                    enabled: true,
                    paused: false,
                    queued: VecDeque::new(),
                    next_id: 0,
                }),
                in_flight: DashMap::new(),
            }),
        })
    }

    /// Outstanding calls, queued or on the wire
    pub fn outstanding_calls(&self) -> usize {
        let queued = self.lock_state().queued.len();
        queued + self.shared.in_flight.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        // A panic while holding the lock leaves the state itself consistent
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the network task. Called with the state lock held so that a
    /// concurrent disable always sees the call in `in_flight`.
    fn dispatch(
        &self,
        id: u64,
        request: HttpRequest,
        tx: oneshot::Sender<CallResult>,
        cancel: CancellationToken,
    ) {
        if cancel.is_cancelled() {
            let _ = tx.send(Err(DeliveryError::Disabled));
            return;
        }

        debug!(
            "HTTP {} {} headers: {:?}",
            request.method,
            request.url,
            request.obfuscated_headers()
        );

        self.shared.in_flight.insert(id, cancel.clone());

        let client = self.client.clone();
        let shared = self.shared.clone();
        let timeout = self.timeout;
        let threshold = self.compression_threshold;

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DeliveryError::Disabled),
                result = tokio::time::timeout(timeout, execute(&client, request, threshold)) => {
                    result.unwrap_or(Err(DeliveryError::Timeout(timeout)))
                }
            };
            shared.in_flight.remove(&id);
            if tx.send(result).is_err() {
                debug!("Caller of HTTP call {} went away before completion", id);
            }
        });
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send_async(&self, request: HttpRequest) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let call = PendingCall::new(rx, cancel.clone());

        let mut state = self.lock_state();
        if !state.enabled {
            let _ = tx.send(Err(DeliveryError::Disabled));
            return call;
        }

        let id = state.next_id;
        state.next_id += 1;

        if state.paused {
            debug!("HTTP client paused, queueing call {} to {}", id, request.url);
            state.queued.push_back(QueuedCall {
                id,
                request,
                tx,
                cancel,
            });
            return call;
        }

        self.dispatch(id, request, tx, cancel);
        drop(state);
        call
    }

    fn pause(&self) {
        let mut state = self.lock_state();
        if !state.paused {
            info!("HTTP client paused");
            state.paused = true;
        }
    }

    fn resume(&self) {
        let mut state = self.lock_state();
        if !state.paused {
            return;
        }
        state.paused = false;

        let queued: Vec<QueuedCall> = state.queued.drain(..).collect();
        info!("HTTP client resumed, sending {} queued calls", queued.len());
        for call in queued {
            self.dispatch(call.id, call.request, call.tx, call.cancel);
        }
    }

    fn set_enabled(&self, enabled: bool) {
        let mut state = self.lock_state();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;

        if enabled {
            info!("HTTP client enabled");
            return;
        }

        let queued: Vec<QueuedCall> = state.queued.drain(..).collect();
        let in_flight = self.shared.in_flight.len();
        for call in queued {
            let _ = call.tx.send(Err(DeliveryError::Disabled));
        }
        for entry in self.shared.in_flight.iter() {
            entry.value().cancel();
        }
        warn!(
            "HTTP client disabled, canceled {} in-flight calls",
            in_flight
        );
    }

    fn is_enabled(&self) -> bool {
        self.lock_state().enabled
    }

    fn is_paused(&self) -> bool {
        self.lock_state().paused
    }
}

async fn execute(client: &Client, request: HttpRequest, threshold: Option<usize>) -> CallResult {
    let HttpRequest {
        url,
        method,
        headers,
        body,
    } = request;

    let mut builder = client.request(method, url.as_str());
    for (key, value) in &headers {
        builder = builder.header(key.as_str(), value.as_str());
    }

    if let Some(body) = body {
        let (body, gzipped) = maybe_compress(body, threshold)?;
        if gzipped {
            builder = builder.header(reqwest::header::CONTENT_ENCODING, "gzip");
        }
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_builder() {
            DeliveryError::InvalidRequest(e.to_string())
        } else {
            DeliveryError::Transport(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;

    debug!("HTTP {} from {} ({} bytes)", status, url, body.len());
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn maybe_compress(body: Bytes, threshold: Option<usize>) -> Result<(Bytes, bool), DeliveryError> {
    match threshold {
        Some(min) if body.len() >= min => {
            let compressed = gzip(&body)
                .map_err(|e| DeliveryError::InvalidRequest(format!("gzip failed: {}", e)))?;
            Ok((Bytes::from(compressed), true))
        }
        _ => Ok((body, false)),
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
