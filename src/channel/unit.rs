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

// Per-destination channel actor
//
// One task owns the batching state machine for a destination. Handles talk
// to it through an unbounded command queue; call outcomes come back through
// a second queue tagged with the batch id, so results of abandoned batches
// can be recognised and ignored.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{BatchPolicy, RetryPolicy};
use crate::delegate::{DelegateChain, Decision};
use crate::enablement::Enablement;
use crate::error::ChannelClosed;
use crate::http::{classify, CallOutcome, CallResult, HttpClient};
use crate::ingestion::{Endpoint, IngestionContext};
use crate::model::{Batch, BatchId, Record, RecordId, StoredRecord};
use crate::storage::LogStore;

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelState {
    Idle,
    Batching,
    AwaitingResponse,
    Suspended,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Idle => "idle",
            ChannelState::Batching => "batching",
            ChannelState::AwaitingResponse => "awaiting-response",
            ChannelState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Startup,
    Timer,
    Critical,
    Threshold,
    Flush,
    Resume,
    Retry,
    Continue,
}

/// Point-in-time view of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub destination: String,
    pub state: ChannelState,
    pub pending: usize,
    pub in_flight_batches: usize,
    pub queued_batches: usize,
    pub backoff_remaining: Option<Duration>,
    pub batches_sent: u64,
    pub delivered_records: u64,
    pub discarded_records: u64,
    pub dropped_records: u64,
}

impl ChannelStatus {
    /// Nothing pending and nothing on the wire
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight_batches == 0 && self.queued_batches == 0
    }
}

pub enum ChannelCommand {
    Enqueue {
        record: Record,
        reply: oneshot::Sender<Option<RecordId>>,
    },
    Flush,
    SetEnabled(bool),
    Pause,
    Resume,
    Status(oneshot::Sender<ChannelStatus>),
    Shutdown(oneshot::Sender<()>),
}

struct BatchOutcome {
    batch_id: BatchId,
    result: CallResult,
}

struct InFlight {
    batch: Batch,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct ChannelStats {
    batches_sent: u64,
    delivered: u64,
    discarded: u64,
    dropped: u64,
}

/// Collaborators shared by every channel of a pipeline
#[derive(Clone)]
pub struct ChannelContext {
    pub store: Arc<dyn LogStore>,
    pub client: Arc<dyn HttpClient>,
    pub enablement: Arc<Enablement>,
    pub ingestion: Arc<IngestionContext>,
}

/// Cloneable handle to a running channel
#[derive(Clone)]
pub struct ChannelHandle {
    destination: String,
    tx: mpsc::UnboundedSender<ChannelCommand>,
    enablement: Arc<Enablement>,
}

impl ChannelHandle {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Persist a record for this destination. Storage problems are logged,
    /// never returned; `None` means the record was not stored.
    pub async fn enqueue(&self, mut record: Record) -> Option<RecordId> {
        record.destination = self.destination.clone();
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ChannelCommand::Enqueue { record, reply })
            .is_err()
        {
            warn!("Channel '{}' is shut down, record not stored", self.destination);
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Send everything pending, batch after batch
    pub fn flush(&self) -> Result<(), ChannelClosed> {
        self.send(ChannelCommand::Flush)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), ChannelClosed> {
        self.enablement.set_enabled(&self.destination, enabled);
        self.send(ChannelCommand::SetEnabled(enabled))
    }

    pub fn pause(&self) -> Result<(), ChannelClosed> {
        self.enablement.pause(&self.destination);
        self.send(ChannelCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), ChannelClosed> {
        self.enablement.resume(&self.destination);
        self.send(ChannelCommand::Resume)
    }

    /// Base URL for batches formed from now on
    pub fn set_log_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!("Channel '{}' log URL set to {}", self.destination, url);
        self.enablement.set_base_url(&self.destination, url);
    }

    pub async fn status(&self) -> Result<ChannelStatus, ChannelClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::Status(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Stop the actor. Records still in flight go back to pending.
    pub async fn shutdown(&self) -> Result<(), ChannelClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(ChannelCommand::Shutdown(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    fn send(&self, command: ChannelCommand) -> Result<(), ChannelClosed> {
        self.tx.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> ChannelClosed {
        ChannelClosed(self.destination.clone())
    }
}

/// Batching and retry state machine for one destination
pub struct ChannelUnit {
    destination: String,
    batch_policy: BatchPolicy,
    retry_policy: RetryPolicy,
    delegates: DelegateChain,
    ctx: ChannelContext,
    rx: mpsc::UnboundedReceiver<ChannelCommand>,
    outcome_tx: mpsc::UnboundedSender<BatchOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<BatchOutcome>,
    state: ChannelState,
    in_flight: Option<InFlight>,
    // Formed batches waiting for the one in flight to finish
    queue: VecDeque<Batch>,
    attempts: HashMap<RecordId, u32>,
    retry_at: Option<Instant>,
    // A trigger arrived while busy or backing off
    deferred: bool,
    draining: bool,
    stats: ChannelStats,
}

impl ChannelUnit {
    pub fn new(
        destination: impl Into<String>,
        batch_policy: BatchPolicy,
        retry_policy: RetryPolicy,
        delegates: DelegateChain,
        ctx: ChannelContext,
    ) -> (Self, ChannelHandle) {
        let destination = destination.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let handle = ChannelHandle {
            destination: destination.clone(),
            tx,
            enablement: ctx.enablement.clone(),
        };

        let unit = Self {
            destination,
            batch_policy,
            retry_policy,
            delegates,
            ctx,
            rx,
            outcome_tx,
            outcome_rx,
            state: ChannelState::Idle,
            in_flight: None,
            queue: VecDeque::new(),
            attempts: HashMap::new(),
            retry_at: None,
            deferred: false,
            draining: false,
            stats: ChannelStats::default(),
        };

        (unit, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands, outcomes and timers until shutdown
    pub async fn run(mut self) {
        info!(
            "Channel '{}' started (max_count={}, flush every {:?})",
            self.destination, self.batch_policy.max_count, self.batch_policy.flush_interval
        );

        // interval_at panics on a zero period
        let period = self.batch_policy.flush_interval.max(MIN_FLUSH_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Records left by a previous run
        if self.pending().await > 0 {
            self.trigger(Trigger::Startup).await;
        }

        loop {
            let retry_at = self.retry_at;
            let retry_timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                command = self.rx.recv() => {
                    match command {
                        Some(ChannelCommand::Shutdown(reply)) => {
                            self.stop().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.stop().await;
                            break;
                        }
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome).await;
                }
                _ = retry_timer => {
                    self.retry_at = None;
                    self.trigger(Trigger::Retry).await;
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }

        info!("Channel '{}' stopped", self.destination);
    }

    async fn handle_command(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Enqueue { record, reply } => {
                let critical = record.is_critical();
                let id = match self.ctx.store.persist(record).await {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!("Channel '{}' failed to persist record: {}", self.destination, e);
                        None
                    }
                };
                let _ = reply.send(id);

                if id.is_none() {
                    return;
                }
                if critical {
                    self.trigger(Trigger::Critical).await;
                } else if self.pending().await >= self.batch_policy.pending_threshold {
                    self.trigger(Trigger::Threshold).await;
                }
            }
            ChannelCommand::Flush => {
                self.draining = true;
                self.trigger(Trigger::Flush).await;
            }
            ChannelCommand::SetEnabled(false) => self.suspend("disabled").await,
            ChannelCommand::Pause => self.suspend("paused").await,
            ChannelCommand::SetEnabled(true) | ChannelCommand::Resume => {
                if self.state == ChannelState::Suspended && self.can_send() {
                    info!("Channel '{}' resumed", self.destination);
                    self.set_state(ChannelState::Idle);
                }
                self.trigger(Trigger::Resume).await;
            }
            ChannelCommand::Status(reply) => {
                let _ = reply.send(self.status().await);
            }
            // Handled by the run loop
            ChannelCommand::Shutdown(_) => {}
        }
    }

    async fn on_tick(&mut self) {
        match self.state {
            ChannelState::Suspended if self.can_send() => {
                info!("Channel '{}' can send again", self.destination);
                self.set_state(ChannelState::Idle);
                self.trigger(Trigger::Timer).await;
            }
            ChannelState::Idle if self.pending().await > 0 => {
                self.trigger(Trigger::Timer).await;
            }
            _ => {}
        }
    }

    async fn trigger(&mut self, trigger: Trigger) {
        debug!("Channel '{}' trigger: {:?}", self.destination, trigger);

        loop {
            if self.in_flight.is_some() || self.retry_at.is_some() {
                self.deferred = true;
                return;
            }
            if !self.can_send() {
                if self.state != ChannelState::Suspended {
                    info!("Channel '{}' suspended: destination or client unavailable", self.destination);
                    self.set_state(ChannelState::Suspended);
                }
                return;
            }

            self.deferred = false;
            self.set_state(ChannelState::Batching);

            let loaded = match self
                .ctx
                .store
                .load_batch(
                    &self.destination,
                    self.batch_policy.max_count,
                    self.batch_policy.max_bytes,
                )
                .await
            {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!("Channel '{}' failed to load batch: {}", self.destination, e);
                    self.set_state(ChannelState::Idle);
                    return;
                }
            };

            if loaded.is_empty() {
                self.draining = false;
                self.set_state(ChannelState::Idle);
                return;
            }

            let dropped = self.form_batches(loaded);
            if !dropped.is_empty() {
                debug!(
                    "Channel '{}': delegates dropped {} records",
                    self.destination,
                    dropped.len()
                );
                self.stats.dropped += dropped.len() as u64;
                self.forget(&dropped);
                if let Err(e) = self.ctx.store.mark_committed(&dropped).await {
                    warn!("Channel '{}' failed to delete dropped records: {}", self.destination, e);
                }
            }

            if self.queue.is_empty() {
                // Every record was dropped; no network call
                self.set_state(ChannelState::Idle);
                if self.draining {
                    continue;
                }
                return;
            }

            self.send_next().await;
            return;
        }
    }

    /// Split loaded records by endpoint, keeping load order within each
    /// batch. Returns the ids of dropped records.
    fn form_batches(&mut self, loaded: Vec<StoredRecord>) -> Vec<RecordId> {
        let default = Endpoint::app_center(
            self.destination.clone(),
            self.ctx
                .enablement
                .base_url(&self.destination)
                .unwrap_or_default(),
        );

        let mut batches: Vec<Batch> = Vec::new();
        let mut dropped = Vec::new();

        for stored in loaded {
            let (endpoint, record) = match self.delegates.decide(stored.id, &stored.record, &default) {
                Decision::PassThrough => (default.clone(), stored.record),
                Decision::Redirect { endpoint, record } => (endpoint, record),
                Decision::Drop => {
                    dropped.push(stored.id);
                    continue;
                }
            };

            match batches.iter_mut().find(|b| b.endpoint == endpoint) {
                Some(batch) => {
                    batch.record_ids.push(stored.id);
                    batch.records.push(record);
                }
                None => batches.push(Batch {
                    id: BatchId::new(),
                    destination: self.destination.clone(),
                    endpoint,
                    record_ids: vec![stored.id],
                    records: vec![record],
                }),
            }
        }

        self.queue.extend(batches);
        dropped
    }

    /// Hand the next formed batch to the client
    async fn send_next(&mut self) {
        while let Some(batch) = self.queue.pop_front() {
            // State may have changed since the batch was formed
            if !self.can_send() {
                let mut ids = batch.record_ids;
                ids.extend(self.take_queued());
                self.release(&ids).await;
                info!("Channel '{}' suspended before sending", self.destination);
                self.set_state(ChannelState::Suspended);
                return;
            }

            let request = match self.ctx.ingestion.build_request(&batch.endpoint, &batch.records) {
                Ok(request) => request,
                Err(e) => {
                    warn!(
                        "Channel '{}' could not encode batch {}: {}",
                        self.destination, batch.id, e
                    );
                    self.fail_terminal(&batch.record_ids).await;
                    continue;
                }
            };

            debug!(
                "Channel '{}' sending batch {} ({} records) to {}",
                self.destination,
                batch.id,
                batch.len(),
                batch.endpoint.base_url
            );

            let call = self.ctx.client.send_async(request);
            let cancel = call.cancel_token();
            let outcome_tx = self.outcome_tx.clone();
            let batch_id = batch.id;
            tokio::spawn(async move {
                let result = call.await;
                let _ = outcome_tx.send(BatchOutcome { batch_id, result });
            });

            self.stats.batches_sent += 1;
            self.in_flight = Some(InFlight { batch, cancel });
            self.set_state(ChannelState::AwaitingResponse);
            return;
        }

        self.set_state(ChannelState::Idle);
    }

    async fn handle_outcome(&mut self, outcome: BatchOutcome) {
        let current = matches!(&self.in_flight, Some(f) if f.batch.id == outcome.batch_id);
        if !current {
            debug!(
                "Channel '{}' ignoring outcome of abandoned batch {}",
                self.destination, outcome.batch_id
            );
            return;
        }
        let Some(InFlight { batch, .. }) = self.in_flight.take() else {
            return;
        };

        match classify(&outcome.result) {
            CallOutcome::Delivered => {
                debug!("Channel '{}' batch {} delivered", self.destination, batch.id);
                self.forget(&batch.record_ids);
                match self.ctx.store.mark_committed(&batch.record_ids).await {
                    Ok(()) => self.stats.delivered += batch.len() as u64,
                    Err(e) => warn!("Channel '{}' failed to commit batch: {}", self.destination, e),
                }
                self.continue_after_batch().await;
            }
            CallOutcome::NonRetryable => {
                warn!(
                    "Channel '{}' batch {} rejected: {}",
                    self.destination,
                    batch.id,
                    describe(&outcome.result)
                );
                self.fail_terminal(&batch.record_ids).await;
                self.continue_after_batch().await;
            }
            CallOutcome::Retryable => {
                let attempt = self.count_attempt(&batch.record_ids);
                if !self.retry_policy.allows_retry(attempt) {
                    warn!(
                        "Channel '{}' batch {} failed {} times, discarding {} records",
                        self.destination,
                        batch.id,
                        attempt,
                        batch.len()
                    );
                    self.fail_terminal(&batch.record_ids).await;
                    self.continue_after_batch().await;
                    return;
                }

                let delay = self.retry_policy.delay_for(attempt);
                warn!(
                    "Channel '{}' batch {} failed ({}), retry {} in {:?}",
                    self.destination,
                    batch.id,
                    describe(&outcome.result),
                    attempt,
                    delay
                );
                let mut ids = batch.record_ids;
                ids.extend(self.take_queued());
                self.release(&ids).await;
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ChannelState::Idle);
            }
            CallOutcome::Withheld => {
                info!(
                    "Channel '{}' batch {} withheld by the client, records kept",
                    self.destination, batch.id
                );
                let mut ids = batch.record_ids;
                ids.extend(self.take_queued());
                self.release(&ids).await;
                self.set_state(ChannelState::Suspended);
            }
        }
    }

    async fn continue_after_batch(&mut self) {
        if !self.queue.is_empty() {
            self.send_next().await;
            return;
        }

        self.set_state(ChannelState::Idle);
        let pending = self.pending().await;
        if pending > 0
            && (self.deferred || self.draining || pending >= self.batch_policy.pending_threshold)
        {
            self.trigger(Trigger::Continue).await;
        }
    }

    /// Abandon in-flight work without touching stored records
    async fn suspend(&mut self, reason: &str) {
        let mut ids = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
            ids.extend(in_flight.batch.record_ids);
        }
        ids.extend(self.take_queued());
        if !ids.is_empty() {
            self.release(&ids).await;
        }

        self.draining = false;
        if self.state != ChannelState::Suspended {
            info!(
                "Channel '{}' suspended ({}), {} records returned to pending",
                self.destination,
                reason,
                ids.len()
            );
        }
        self.set_state(ChannelState::Suspended);
    }

    async fn stop(&mut self) {
        let mut ids = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
            ids.extend(in_flight.batch.record_ids);
        }
        ids.extend(self.take_queued());
        if !ids.is_empty() {
            self.release(&ids).await;
        }
    }

    fn take_queued(&mut self) -> Vec<RecordId> {
        self.queue
            .drain(..)
            .flat_map(|batch| batch.record_ids)
            .collect()
    }

    /// Back to pending for a later window
    async fn release(&mut self, ids: &[RecordId]) {
        if let Err(e) = self.ctx.store.mark_failed(ids, true).await {
            warn!("Channel '{}' failed to release records: {}", self.destination, e);
        }
    }

    async fn fail_terminal(&mut self, ids: &[RecordId]) {
        self.forget(ids);
        match self.ctx.store.mark_failed(ids, false).await {
            Ok(discarded) => self.stats.discarded += discarded as u64,
            Err(e) => warn!("Channel '{}' failed to discard records: {}", self.destination, e),
        }
    }

    /// Record one more failed attempt for each id; returns the highest count
    fn count_attempt(&mut self, ids: &[RecordId]) -> u32 {
        ids.iter()
            .map(|id| {
                let attempts = self.attempts.entry(*id).or_insert(0);
                *attempts += 1;
                *attempts
            })
            .max()
            .unwrap_or(1)
    }

    fn forget(&mut self, ids: &[RecordId]) {
        for id in ids {
            self.attempts.remove(id);
        }
    }

    fn can_send(&self) -> bool {
        self.ctx.enablement.can_send(&self.destination)
            && self.ctx.client.is_enabled()
            && !self.ctx.client.is_paused()
    }

    async fn pending(&self) -> usize {
        match self.ctx.store.pending_count(&self.destination).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Channel '{}' failed to count pending records: {}", self.destination, e);
                0
            }
        }
    }

    async fn status(&self) -> ChannelStatus {
        ChannelStatus {
            destination: self.destination.clone(),
            state: self.state,
            pending: self.pending().await,
            in_flight_batches: usize::from(self.in_flight.is_some()),
            queued_batches: self.queue.len(),
            backoff_remaining: self
                .retry_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            batches_sent: self.stats.batches_sent,
            delivered_records: self.stats.delivered,
            discarded_records: self.stats.discarded,
            dropped_records: self.stats.dropped,
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!("Channel '{}': {} -> {}", self.destination, self.state, state);
            self.state = state;
        }
    }
}

fn describe(result: &CallResult) -> String {
    match result {
        Ok(response) => format!("HTTP {}", response.status),
        Err(e) => e.to_string(),
    }
}
