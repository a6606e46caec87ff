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
use thiserror::Error;

/// Errors raised by the record store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Capacity is reached and nothing is evictable (everything is in flight)
    #[error("storage full: capacity of {capacity} records reached with no evictable record")]
    StorageFull { capacity: usize },

    /// A schema step could not run; the store has been reset to empty
    #[error("migration from version {from} to {to} failed: {reason}")]
    MigrationFailed { from: u32, to: u32, reason: String },

    /// The requested range is not a forward path between known versions.
    /// Nothing is touched.
    #[error("unsupported migration path from version {from} to {to} (latest known version is {latest})")]
    UnsupportedMigration { from: u32, to: u32, latest: u32 },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors reported by the delivery client through a call's completion
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("client is disabled")]
    Disabled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The channel actor has stopped and no longer accepts commands
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("channel '{0}' is shut down")]
pub struct ChannelClosed(pub String);

impl DeliveryError {
    /// Network-level failures are worth retrying; malformed requests are not.
    /// `Disabled` is a client-state error handled by re-queueing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Timeout(_) | DeliveryError::Transport(_))
    }

    pub fn is_client_state(&self) -> bool {
        matches!(self, DeliveryError::Disabled)
    }
}
