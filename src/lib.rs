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

// Telemetry Pipeline Library
//
// Durable, batched delivery of application telemetry:
// - Persists records in a versioned SQLite store that survives restarts and upgrades
// - Batches per destination with priority triggers and exponential backoff
// - Routes records through delegates that can drop or redirect them
// - Sends over HTTP with explicit enable/disable and pause/resume state

pub mod channel;
pub mod config;
pub mod delegate;
pub mod enablement;
pub mod error;
pub mod http;
pub mod identity;
pub mod ingestion;
pub mod model;
pub mod observer;
pub mod pipeline;
pub mod storage;

// Re-export main types
pub use channel::{ChannelHandle, ChannelState, ChannelStatus, ChannelUnit};
pub use config::{load_config, load_config_with_env, PipelineConfig};
pub use delegate::{ChannelDelegate, Decision, DelegateChain, EventFilterDelegate, OneCollectorDelegate};
pub use enablement::Enablement;
pub use error::{ChannelClosed, DeliveryError, StoreError};
pub use http::{HttpClient, HttpRequest, HttpResponse, PendingCall, ReqwestHttpClient};
pub use ingestion::{Endpoint, IngestionContext, Protocol};
pub use model::{Batch, BatchId, DeliveryState, Priority, Record, RecordId, StoredRecord};
pub use observer::{DiscardReason, PipelineObserver, TracingObserver};
pub use pipeline::Pipeline;
pub use storage::{LogStore, SqliteLogStore, StoreFactory};
