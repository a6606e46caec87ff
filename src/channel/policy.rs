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

use std::time::Duration;

use crate::config::{BatchSettings, RetrySettings};

/// When a batch is formed and how large it may get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_count: usize,
    pub max_bytes: usize,
    pub flush_interval: Duration,
    /// Pending records that trigger a flush without waiting for the timer
    pub pending_threshold: usize,
}

impl BatchPolicy {
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            max_count: settings.max_count,
            max_bytes: settings.max_bytes,
            flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
            pending_threshold: settings.pending_threshold.unwrap_or(settings.max_count).max(1),
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from_settings(&BatchSettings::default())
    }
}

/// Exponential backoff bounded by a maximum delay and retry count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_retries: settings.max_retries,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1),
    /// capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether the `attempt`-th failure still leaves a retry
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
