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

use tracing::{error, warn};

/// Why records left the store without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Terminal delivery failure: rejected by the backend or out of retries
    DeliveryFailed,
    /// Stored bytes could not be decoded into a record
    Unreadable,
}

/// Receives loss telemetry: discards, evictions and store resets.
///
/// All methods default to no-ops so implementors only pick what they report.
pub trait PipelineObserver: Send + Sync {
    fn on_discarded(&self, _destination: &str, _count: usize, _reason: DiscardReason) {}

    fn on_evicted(&self, _destination: &str, _count: usize) {}

    fn on_store_reset(&self, _reason: &str) {}
}

/// Observer that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_discarded(&self, destination: &str, count: usize, reason: DiscardReason) {
        warn!(
            "Discarded {} records for destination '{}' ({:?})",
            count, destination, reason
        );
    }

    fn on_evicted(&self, destination: &str, count: usize) {
        warn!(
            "Storage full: evicted {} records from destination '{}'",
            count, destination
        );
    }

    fn on_store_reset(&self, reason: &str) {
        error!("Record store was reset to empty: {}", reason);
    }
}
