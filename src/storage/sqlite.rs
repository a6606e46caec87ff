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

// SQLite record store implementation

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use super::backend::LogStore;
use super::migrations::{self, LATEST_VERSION};
use crate::error::StoreError;
use crate::model::{DeliveryState, Record, RecordId, StoredRecord};
use crate::observer::{DiscardReason, PipelineObserver};

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const INSERT_LOG: &str = "INSERT INTO logs (group_id, log, auth_token, target_key, priority, timestamp)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

struct Inner {
    conn: Connection,
    // record id -> destination, for records handed out by load_batch
    in_flight: HashMap<i64, String>,
}

/// SQLite-backed `LogStore`. Every operation runs on the blocking pool.
pub struct SqliteLogStore {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
    observer: Arc<dyn PipelineObserver>,
}

impl SqliteLogStore {
    /// Open (or create) a store file and bring its schema to the latest version
    pub fn open<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn, capacity, observer, &path.display().to_string())
    }

    /// In-memory store, nothing survives the process
    pub fn open_in_memory(
        capacity: usize,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, capacity, observer, ":memory:")
    }

    fn from_connection(
        mut conn: Connection,
        capacity: usize,
        observer: Arc<dyn PipelineObserver>,
        location: &str,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        prepare_schema(&mut conn, observer.as_ref())?;

        info!(
            "Record store opened at {} (capacity {} records)",
            location, capacity
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                conn,
                in_flight: HashMap::new(),
            })),
            capacity,
            observer,
        })
    }

    async fn with_inner<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Inner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        spawn_blocking(move || {
            let mut guard = inner.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    fn report_discards(&self, discarded: &BTreeMap<String, usize>, reason: DiscardReason) {
        for (destination, count) in discarded {
            self.observer.on_discarded(destination, *count, reason);
        }
    }
}

/// Fresh files get the v0 layout and then take the regular upgrade path.
/// Anything that cannot be migrated is reset rather than left half-upgraded.
fn prepare_schema(conn: &mut Connection, observer: &dyn PipelineObserver) -> Result<(), StoreError> {
    if !migrations::table_exists(conn)? {
        migrations::create_initial(conn)?;
        conn.pragma_update(None, "user_version", migrations::INITIAL_VERSION)?;
    }

    let version = migrations::current_version(conn)?;
    let result = if version > LATEST_VERSION {
        Err(StoreError::MigrationFailed {
            from: version,
            to: LATEST_VERSION,
            reason: "store was written by a newer schema".to_string(),
        })
    } else {
        migrations::migrate(conn, version, LATEST_VERSION)
    };

    if let Err(e) = result {
        warn!("Resetting record store: {}", e);
        migrations::reset(conn)?;
        observer.on_store_reset(&e.to_string());
    }
    Ok(())
}

fn count_all(conn: &Connection) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Oldest pending record in the lowest priority tier
fn eviction_candidate(
    conn: &Connection,
    in_flight: &HashMap<i64, String>,
) -> Result<Option<(i64, String)>, StoreError> {
    let mut stmt =
        conn.prepare_cached("SELECT id, group_id FROM logs ORDER BY priority ASC, id ASC")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        if !in_flight.contains_key(&id) {
            return Ok(Some((id, row.get(1)?)));
        }
    }
    Ok(None)
}

fn make_room(
    conn: &Connection,
    in_flight: &HashMap<i64, String>,
    capacity: usize,
) -> Result<BTreeMap<String, usize>, StoreError> {
    let mut evicted = BTreeMap::new();
    let mut total = count_all(conn)?;
    while total >= capacity {
        match eviction_candidate(conn, in_flight)? {
            Some((id, destination)) => {
                conn.execute("DELETE FROM logs WHERE id = ?1", params![id])?;
                *evicted.entry(destination).or_insert(0) += 1;
                total -= 1;
            }
            None => return Err(StoreError::StorageFull { capacity }),
        }
    }
    Ok(evicted)
}

fn destination_of(conn: &Connection, id: i64) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT group_id FROM logs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn persist(&self, record: Record) -> Result<RecordId, StoreError> {
        let log = serde_json::to_string(&record)?;
        let size = log.len();
        let destination = record.destination.clone();
        let capacity = self.capacity;

        let (id, evicted) = self
            .with_inner(move |inner| {
                // Eviction and insert commit together or not at all
                let tx = inner.conn.transaction()?;
                let evicted = make_room(&tx, &inner.in_flight, capacity)?;
                tx.execute(
                    INSERT_LOG,
                    params![
                        record.destination,
                        log,
                        record.auth_token,
                        record.target_key,
                        record.priority.as_i64(),
                        record.created_at.timestamp_millis(),
                    ],
                )?;
                let id = RecordId(tx.last_insert_rowid());
                tx.commit()?;
                Ok((id, evicted))
            })
            .await?;

        for (evicted_from, count) in &evicted {
            self.observer.on_evicted(evicted_from, *count);
        }

        debug!(
            "Persisted record {} ({} bytes) for destination '{}'",
            id, size, destination
        );
        Ok(id)
    }

    async fn load_batch(
        &self,
        destination: &str,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let group = destination.to_string();
        let (batch, unreadable) = self
            .with_inner(move |inner| {
                let mut batch: Vec<StoredRecord> = Vec::new();
                let mut unreadable = Vec::new();
                let mut bytes = 0usize;
                let mut batch_token: Option<Option<String>> = None;

                {
                    let mut stmt = inner.conn.prepare_cached(
                        "SELECT id, log, auth_token FROM logs WHERE group_id = ?1 ORDER BY id ASC",
                    )?;
                    let mut rows = stmt.query(params![group])?;
                    while let Some(row) = rows.next()? {
                        if batch.len() >= max_count {
                            break;
                        }
                        let id: i64 = row.get(0)?;
                        if inner.in_flight.contains_key(&id) {
                            continue;
                        }
                        let log: String = row.get(1)?;
                        let token: Option<String> = row.get(2)?;

                        // One batch never mixes auth tokens
                        if let Some(first) = &batch_token {
                            if *first != token {
                                break;
                            }
                        }
                        if !batch.is_empty() && bytes + log.len() > max_bytes {
                            break;
                        }

                        let record: Record = match serde_json::from_str(&log) {
                            Ok(record) => record,
                            Err(e) => {
                                warn!("Dropping unreadable record {}: {}", id, e);
                                unreadable.push(id);
                                continue;
                            }
                        };

                        if batch_token.is_none() {
                            batch_token = Some(token);
                        }
                        bytes += log.len();
                        batch.push(StoredRecord {
                            id: RecordId(id),
                            record,
                            size_bytes: log.len(),
                        });
                    }
                }

                for id in &unreadable {
                    inner
                        .conn
                        .execute("DELETE FROM logs WHERE id = ?1", params![id])?;
                }
                for stored in &batch {
                    inner.in_flight.insert(stored.id.0, group.clone());
                }
                Ok((batch, unreadable.len()))
            })
            .await?;

        if unreadable > 0 {
            self.observer
                .on_discarded(destination, unreadable, DiscardReason::Unreadable);
        }

        debug!(
            "Loaded {} records for destination '{}'",
            batch.len(),
            destination
        );
        Ok(batch)
    }

    async fn mark_committed(&self, ids: &[RecordId]) -> Result<(), StoreError> {
        let ids = ids.to_vec();
        self.with_inner(move |inner| {
            let tx = inner.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached("DELETE FROM logs WHERE id = ?1")?;
                for id in &ids {
                    stmt.execute(params![id.0])?;
                }
            }
            tx.commit()?;
            for id in &ids {
                inner.in_flight.remove(&id.0);
            }
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, ids: &[RecordId], retryable: bool) -> Result<usize, StoreError> {
        let ids = ids.to_vec();
        if retryable {
            return self
                .with_inner(move |inner| {
                    for id in &ids {
                        inner.in_flight.remove(&id.0);
                    }
                    Ok(0)
                })
                .await;
        }

        let discarded = self
            .with_inner(move |inner| {
                let mut discarded: BTreeMap<String, usize> = BTreeMap::new();
                for id in &ids {
                    inner.in_flight.remove(&id.0);
                    if let Some(destination) = destination_of(&inner.conn, id.0)? {
                        inner
                            .conn
                            .execute("DELETE FROM logs WHERE id = ?1", params![id.0])?;
                        *discarded.entry(destination).or_insert(0) += 1;
                    }
                }
                Ok(discarded)
            })
            .await?;

        self.report_discards(&discarded, DiscardReason::DeliveryFailed);
        Ok(discarded.values().sum())
    }

    async fn migrate(&self, from: u32, to: u32) -> Result<(), StoreError> {
        // A bad range is the caller's mistake; stored records stay
        migrations::check_range(from, to)?;

        let result = self
            .with_inner(move |inner| match migrations::migrate(&mut inner.conn, from, to) {
                Ok(()) => Ok(Ok(())),
                Err(e @ StoreError::MigrationFailed { .. }) => {
                    warn!("Resetting record store: {}", e);
                    migrations::reset(&mut inner.conn)?;
                    inner.in_flight.clear();
                    Ok(Err(e))
                }
                Err(e) => Ok(Err(e)),
            })
            .await?;

        if let Err(e) = &result {
            if matches!(e, StoreError::MigrationFailed { .. }) {
                self.observer.on_store_reset(&e.to_string());
            }
        }
        result
    }

    async fn pending_count(&self, destination: &str) -> Result<usize, StoreError> {
        let group = destination.to_string();
        self.with_inner(move |inner| {
            let stored: i64 = inner.conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE group_id = ?1",
                params![group],
                |row| row.get(0),
            )?;
            let in_flight = inner
                .in_flight
                .values()
                .filter(|d| **d == group)
                .count();
            Ok((stored as usize).saturating_sub(in_flight))
        })
        .await
    }

    async fn total_count(&self) -> Result<usize, StoreError> {
        self.with_inner(|inner| count_all(&inner.conn)).await
    }

    async fn record_state(&self, id: RecordId) -> Result<Option<DeliveryState>, StoreError> {
        self.with_inner(move |inner| {
            if destination_of(&inner.conn, id.0)?.is_none() {
                return Ok(None);
            }
            if inner.in_flight.contains_key(&id.0) {
                Ok(Some(DeliveryState::InFlight))
            } else {
                Ok(Some(DeliveryState::Pending))
            }
        })
        .await
    }

    async fn schema_version(&self) -> Result<u32, StoreError> {
        self.with_inner(|inner| Ok(migrations::current_version(&inner.conn)?))
            .await
    }

    fn store_type(&self) -> &str {
        "sqlite"
    }
}
