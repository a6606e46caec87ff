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

// Durable record store trait

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{DeliveryState, Record, RecordId, StoredRecord};

/// Durable store of pending and in-flight records.
///
/// The store is the single source of truth: the channel only ever holds
/// transient copies of the records in a batch it is forming or waiting on.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append a record.
    ///
    /// When capacity is reached, the oldest pending record of the lowest
    /// priority tier is evicted first. Fails with `StorageFull` only when
    /// every stored record is in flight.
    async fn persist(&self, record: Record) -> Result<RecordId, StoreError>;

    /// Load up to `max_count` pending records for `destination`, oldest
    /// first, stopping once `max_bytes` of serialized records is reached.
    /// Returned records are in flight until committed or failed.
    ///
    /// # Arguments
    /// * `destination` - Channel group the records belong to
    /// * `max_count` - Maximum number of records
    /// * `max_bytes` - Cumulative size limit; the first record is always included
    async fn load_batch(
        &self,
        destination: &str,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Delete delivered records. Unknown ids are ignored.
    async fn mark_committed(&self, ids: &[RecordId]) -> Result<(), StoreError>;

    /// Return records to pending if `retryable`, otherwise delete them.
    /// Returns the number of records discarded.
    async fn mark_failed(&self, ids: &[RecordId], retryable: bool) -> Result<usize, StoreError>;

    /// Run schema steps from `from` to `to`. On failure the store is reset
    /// to empty and `MigrationFailed` is returned.
    async fn migrate(&self, from: u32, to: u32) -> Result<(), StoreError>;

    /// Pending (not in flight) records for `destination`
    async fn pending_count(&self, destination: &str) -> Result<usize, StoreError>;

    /// All stored records, in flight or not
    async fn total_count(&self) -> Result<usize, StoreError>;

    /// `None` once the record was committed, discarded or evicted
    async fn record_state(&self, id: RecordId) -> Result<Option<DeliveryState>, StoreError>;

    async fn schema_version(&self) -> Result<u32, StoreError>;

    /// Get store type identifier
    fn store_type(&self) -> &str;
}
