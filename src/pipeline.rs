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

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{BatchPolicy, ChannelContext, ChannelHandle, ChannelStatus, ChannelUnit, RetryPolicy};
use crate::config::PipelineConfig;
use crate::delegate::{DelegateChain, EventFilterDelegate, OneCollectorDelegate};
use crate::enablement::Enablement;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::identity::{FileInstallId, InstallIdProvider, StaticInstallId};
use crate::ingestion::IngestionContext;
use crate::model::{Record, RecordId};
use crate::observer::PipelineObserver;
use crate::storage::{LogStore, StoreFactory};

/// Store, client and one channel per configured destination
pub struct Pipeline {
    store: Arc<dyn LogStore>,
    client: Arc<dyn HttpClient>,
    enablement: Arc<Enablement>,
    channels: BTreeMap<String, ChannelHandle>,
    tasks: Vec<JoinHandle<()>>,
    one_collector: Option<Arc<OneCollectorDelegate>>,
    event_filter: Arc<EventFilterDelegate>,
    install_id: String,
}

impl Pipeline {
    /// Open the configured store and start every channel.
    /// Must be called from within a tokio runtime.
    pub fn start(config: &PipelineConfig, observer: Arc<dyn PipelineObserver>) -> Result<Self> {
        let store = StoreFactory::create(&config.store, observer)?;
        let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(&config.http)?);
        let install_id = resolve_install_id(config)?;
        Self::with_components(config, store, client, install_id)
    }

    /// Start with an existing store and client
    pub fn with_components(
        config: &PipelineConfig,
        store: Arc<dyn LogStore>,
        client: Arc<dyn HttpClient>,
        install_id: impl Into<String>,
    ) -> Result<Self> {
        let install_id = install_id.into();
        let enablement = Arc::new(Enablement::new());
        let ingestion = Arc::new(IngestionContext::new(
            config.ingestion.app_secret.clone(),
            install_id.clone(),
        ));

        let event_filter = Arc::new(EventFilterDelegate::new(
            config.event_filter.blocked_categories.iter().cloned(),
        ));
        let one_collector = config.one_collector.as_ref().map(|oc| {
            Arc::new(OneCollectorDelegate::new(
                oc.categories.iter().cloned(),
                install_id.clone(),
                oc.base_url.clone(),
            ))
        });

        // Filtering runs first so blocked records are never redirected
        let mut delegates = DelegateChain::new().with(event_filter.clone());
        if let Some(delegate) = &one_collector {
            delegates.register(delegate.clone());
        }

        let ctx = ChannelContext {
            store: store.clone(),
            client: client.clone(),
            enablement: enablement.clone(),
            ingestion,
        };

        let mut channels = BTreeMap::new();
        let mut tasks = Vec::new();
        for channel in &config.channels {
            enablement.configure(&channel.destination, channel.base_url.clone(), channel.enabled);

            let (unit, handle) = ChannelUnit::new(
                channel.destination.clone(),
                BatchPolicy::from_settings(&channel.batch),
                RetryPolicy::from_settings(&channel.retry),
                delegates.clone(),
                ctx.clone(),
            );
            tasks.push(unit.spawn());
            channels.insert(channel.destination.clone(), handle);
        }

        info!(
            "Pipeline started: {} channels, {} delegates, store '{}'",
            channels.len(),
            delegates.len(),
            store.store_type()
        );

        Ok(Self {
            store,
            client,
            enablement,
            channels,
            tasks,
            one_collector,
            event_filter,
            install_id,
        })
    }

    pub fn channel(&self, destination: &str) -> Option<&ChannelHandle> {
        self.channels.get(destination)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelHandle> {
        self.channels.values()
    }

    /// Route a record to the channel named by its destination
    pub async fn enqueue(&self, record: Record) -> Option<RecordId> {
        match self.channels.get(&record.destination) {
            Some(channel) => channel.enqueue(record).await,
            None => {
                warn!("No channel for destination '{}', record dropped", record.destination);
                None
            }
        }
    }

    pub fn flush_all(&self) {
        for channel in self.channels.values() {
            if let Err(e) = channel.flush() {
                warn!("{}", e);
            }
        }
    }

    /// Hook for the connectivity observer: offline pauses the client and
    /// every channel, online resumes them
    pub fn on_connectivity_changed(&self, online: bool) {
        info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        if online {
            self.client.resume();
        } else {
            self.client.pause();
        }
        for channel in self.channels.values() {
            let result = if online { channel.resume() } else { channel.pause() };
            if let Err(e) = result {
                warn!("{}", e);
            }
        }
    }

    /// Enable or disable delivery as a whole. Disabling cancels every
    /// outstanding call; stored records are kept.
    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.client.set_enabled(true);
        }
        for channel in self.channels.values() {
            if let Err(e) = channel.set_enabled(enabled) {
                warn!("{}", e);
            }
        }
        if !enabled {
            self.client.set_enabled(false);
        }
    }

    pub fn set_log_url(&self, destination: &str, url: impl Into<String>) -> Result<()> {
        let channel = self
            .channels
            .get(destination)
            .ok_or_else(|| anyhow!("Unknown destination '{}'", destination))?;
        channel.set_log_url(url);
        Ok(())
    }

    /// Returns false when no alternate collector is configured
    pub fn set_one_collector_url(&self, url: impl Into<String>) -> bool {
        match &self.one_collector {
            Some(delegate) => {
                delegate.set_log_url(url);
                true
            }
            None => false,
        }
    }

    pub fn event_filter(&self) -> &Arc<EventFilterDelegate> {
        &self.event_filter
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    pub fn enablement(&self) -> &Arc<Enablement> {
        &self.enablement
    }

    pub fn install_id(&self) -> &str {
        &self.install_id
    }

    pub async fn status(&self) -> Vec<ChannelStatus> {
        let mut statuses = Vec::with_capacity(self.channels.len());
        for channel in self.channels.values() {
            match channel.status().await {
                Ok(status) => statuses.push(status),
                Err(e) => warn!("{}", e),
            }
        }
        statuses
    }

    /// Wait until every channel has nothing pending and nothing in flight.
    /// Returns false on timeout.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let statuses = self.status().await;
            if statuses.iter().all(ChannelStatus::is_drained) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop every channel; in-flight records return to pending
    pub async fn shutdown(self) -> Result<()> {
        for channel in self.channels.values() {
            if let Err(e) = channel.shutdown().await {
                warn!("{}", e);
            }
        }
        for task in self.tasks {
            task.await.context("Channel task panicked")?;
        }
        info!("Pipeline stopped");
        Ok(())
    }
}

fn resolve_install_id(config: &PipelineConfig) -> Result<String> {
    if let Some(id) = &config.ingestion.install_id {
        return Ok(StaticInstallId::new(id.clone()).install_id());
    }
    match config.store.backend.as_str() {
        "sqlite" => Ok(FileInstallId::beside_store(&config.store.path)
            .context("Failed to load install id")?
            .install_id()),
        _ => Ok(Uuid::new_v4().to_string()),
    }
}
