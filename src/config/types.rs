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

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub one_collector: Option<OneCollectorConfig>,
    #[serde(default)]
    pub event_filter: EventFilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    pub fn channel(&self, destination: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.destination == destination)
    }
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Store type: "sqlite" or "memory"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    #[serde(default = "default_store_path")]
    pub path: String,

    /// Maximum number of stored records before eviction
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            max_records: default_max_records(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections_per_host: usize,

    #[serde(default = "default_true")]
    pub compression: bool,

    /// Bodies at least this large are gzip-compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_connections_per_host: default_max_connections(),
            compression: true,
            compression_threshold_bytes: default_compression_threshold(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IngestionConfig {
    #[serde(default)]
    pub app_secret: Option<String>,

    /// Fixed install id; generated and stored next to the record store when absent
    #[serde(default)]
    pub install_id: Option<String>,
}

/// Per-destination channel settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub destination: String,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_count")]
    pub max_count: usize,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Pending count that triggers an immediate flush; defaults to `max_count`
    #[serde(default)]
    pub pending_threshold: Option<usize>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_bytes: default_max_bytes(),
            flush_interval_ms: default_flush_interval(),
            pending_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_retries: default_retries(),
        }
    }
}

/// Alternate collector that selected categories are redirected to
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OneCollectorConfig {
    pub base_url: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EventFilterConfig {
    #[serde(default)]
    pub blocked_categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,  // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String,  // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool { true }
fn default_store_backend() -> String { "sqlite".to_string() }
fn default_store_path() -> String { "data/telemetry.db".to_string() }
fn default_max_records() -> usize { 10_000 }
fn default_timeout() -> u64 { 30 }
fn default_max_connections() -> usize { 4 }
fn default_compression_threshold() -> usize { 1400 }
fn default_max_count() -> usize { 50 }
fn default_max_bytes() -> usize { 1024 * 1024 }
fn default_flush_interval() -> u64 { 3000 }
fn default_base_delay() -> u64 { 10_000 }
fn default_max_delay() -> u64 { 20 * 60 * 1000 }
fn default_retries() -> u32 { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
