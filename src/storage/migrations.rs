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

//! Versioned schema for the log table.
//!
//! The version lives in `PRAGMA user_version`. Version 0 is the initial
//! layout; every later version adds one column and backfills it from the
//! JSON already stored in `log`. Steps run in strict order, each inside its
//! own transaction together with the version bump, and each one checks
//! whether its column already exists so re-running a step is harmless.

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;

pub const INITIAL_VERSION: u32 = 0;
pub const AUTH_TOKEN_VERSION: u32 = 1;
pub const TARGET_KEY_VERSION: u32 = 2;
pub const PRIORITY_VERSION: u32 = 3;
pub const TIMESTAMP_VERSION: u32 = 4;

pub const LATEST_VERSION: u32 = TIMESTAMP_VERSION;

struct Step {
    version: u32,
    description: &'static str,
    apply: fn(&Transaction<'_>) -> rusqlite::Result<()>,
}

const STEPS: &[Step] = &[
    Step {
        version: AUTH_TOKEN_VERSION,
        description: "auth token association",
        apply: add_auth_token,
    },
    Step {
        version: TARGET_KEY_VERSION,
        description: "per-record destination key",
        apply: add_target_key,
    },
    Step {
        version: PRIORITY_VERSION,
        description: "persistence priority",
        apply: add_priority,
    },
    Step {
        version: TIMESTAMP_VERSION,
        description: "creation timestamp",
        apply: add_timestamp,
    },
];

/// Create the version 0 layout if the table does not exist yet
pub fn create_initial(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS logs (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id  TEXT NOT NULL,
            log       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_logs_group ON logs(group_id);
        ",
    )
}

pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))
}

pub fn table_exists(conn: &Connection) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'logs'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Reject ranges that are not a forward path between known versions
pub fn check_range(from: u32, to: u32) -> Result<(), StoreError> {
    if from > to || to > LATEST_VERSION {
        return Err(StoreError::UnsupportedMigration {
            from,
            to,
            latest: LATEST_VERSION,
        });
    }
    Ok(())
}

/// Run every step in `(from, to]` in version order.
///
/// An unsupported range fails before anything runs. A failed step returns
/// `MigrationFailed` and the caller is expected to reset the store; no
/// partial step is ever committed.
pub fn migrate(conn: &mut Connection, from: u32, to: u32) -> Result<(), StoreError> {
    check_range(from, to)?;

    for step in STEPS
        .iter()
        .filter(|step| step.version > from && step.version <= to)
    {
        debug!("Applying schema step {} ({})", step.version, step.description);
        run_step(conn, step).map_err(|e| StoreError::MigrationFailed {
            from,
            to,
            reason: format!("step {} ({}): {}", step.version, step.description, e),
        })?;
    }

    if from < to {
        info!("Record store migrated from version {} to {}", from, to);
    }
    Ok(())
}

fn run_step(conn: &mut Connection, step: &Step) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    (step.apply)(&tx)?;
    tx.pragma_update(None, "user_version", step.version)?;
    tx.commit()
}

/// Drop everything and recreate an empty latest-version table
pub fn reset(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch("DROP INDEX IF EXISTS idx_logs_group; DROP TABLE IF EXISTS logs;")?;
    conn.pragma_update(None, "user_version", INITIAL_VERSION)?;
    create_initial(conn)?;
    migrate(conn, INITIAL_VERSION, LATEST_VERSION)
}

fn has_column(conn: &Connection, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('logs')")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_auth_token(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !has_column(tx, "auth_token")? {
        tx.execute_batch("ALTER TABLE logs ADD COLUMN auth_token TEXT;")?;
    }
    tx.execute_batch(
        "UPDATE logs SET auth_token = json_extract(log, '$.auth_token') WHERE auth_token IS NULL;",
    )
}

fn add_target_key(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !has_column(tx, "target_key")? {
        tx.execute_batch("ALTER TABLE logs ADD COLUMN target_key TEXT;")?;
    }
    tx.execute_batch(
        "UPDATE logs SET target_key = json_extract(log, '$.target_key') WHERE target_key IS NULL;
         CREATE INDEX IF NOT EXISTS idx_logs_target_key ON logs(target_key);",
    )
}

fn add_priority(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !has_column(tx, "priority")? {
        tx.execute_batch("ALTER TABLE logs ADD COLUMN priority INTEGER NOT NULL DEFAULT 1;")?;
    }
    tx.execute_batch(
        "UPDATE logs SET priority = 2 WHERE json_extract(log, '$.priority') = 'critical';
         CREATE INDEX IF NOT EXISTS idx_logs_priority ON logs(priority, id);",
    )
}

fn add_timestamp(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !has_column(tx, "timestamp")? {
        tx.execute_batch("ALTER TABLE logs ADD COLUMN timestamp INTEGER NOT NULL DEFAULT 0;")?;
    }
    tx.execute_batch(
        "UPDATE logs
         SET timestamp = COALESCE(
             CAST(ROUND((julianday(json_extract(log, '$.created_at')) - 2440587.5) * 86400000) AS INTEGER), 0)
         WHERE timestamp = 0;",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, Record};

    fn v0_with_rows(records: &[Record]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_initial(&conn).unwrap();
        for record in records {
            conn.execute(
                "INSERT INTO logs (group_id, log) VALUES (?1, ?2)",
                rusqlite::params![record.destination, serde_json::to_string(record).unwrap()],
            )
            .unwrap();
        }
        conn
    }

    type Row = (i64, String, Option<String>, Option<String>, i64, i64);

    fn snapshot(conn: &Connection) -> Vec<Row> {
        let mut stmt = conn
            .prepare(
                "SELECT id, group_id, auth_token, target_key, priority, timestamp
                 FROM logs ORDER BY id",
            )
            .unwrap();
        stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
    }

    fn sample_records() -> Vec<Record> {
        vec![
            Record::new("analytics", "event", serde_json::json!({"n": 1})),
            Record::new("analytics", "crash", serde_json::json!({"n": 2}))
                .with_priority(Priority::Critical)
                .with_auth_token("token-a"),
            Record::new("crashes", "crash", serde_json::json!({"n": 3})).with_target_key("ikey-1"),
        ]
    }

    #[test]
    fn test_direct_and_stepwise_migrations_agree() {
        let records = sample_records();

        let mut direct = v0_with_rows(&records);
        migrate(&mut direct, INITIAL_VERSION, LATEST_VERSION).unwrap();

        let mut stepwise = v0_with_rows(&records);
        for version in INITIAL_VERSION..LATEST_VERSION {
            migrate(&mut stepwise, version, version + 1).unwrap();
        }

        assert_eq!(current_version(&direct).unwrap(), LATEST_VERSION);
        assert_eq!(current_version(&stepwise).unwrap(), LATEST_VERSION);
        assert_eq!(snapshot(&direct), snapshot(&stepwise));
    }

    #[test]
    fn test_backfill_from_stored_json() {
        let mut conn = v0_with_rows(&sample_records());
        migrate(&mut conn, INITIAL_VERSION, LATEST_VERSION).unwrap();

        let rows = snapshot(&conn);
        assert_eq!(rows[0].4, Priority::Normal.as_i64());
        assert_eq!(rows[1].2.as_deref(), Some("token-a"));
        assert_eq!(rows[1].4, Priority::Critical.as_i64());
        assert_eq!(rows[2].3.as_deref(), Some("ikey-1"));
        assert!(rows.iter().all(|row| row.5 > 0));
    }

    #[test]
    fn test_rerunning_a_step_is_harmless() {
        let mut conn = v0_with_rows(&sample_records());
        migrate(&mut conn, INITIAL_VERSION, PRIORITY_VERSION).unwrap();
        // Pretend the version stamp was lost after the step committed
        conn.pragma_update(None, "user_version", TARGET_KEY_VERSION)
            .unwrap();
        migrate(&mut conn, TARGET_KEY_VERSION, LATEST_VERSION).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
        assert_eq!(snapshot(&conn).len(), 3);
    }

    #[test]
    fn test_backward_migration_is_rejected() {
        let mut conn = v0_with_rows(&[]);
        migrate(&mut conn, INITIAL_VERSION, LATEST_VERSION).unwrap();
        let result = migrate(&mut conn, LATEST_VERSION, AUTH_TOKEN_VERSION);
        assert!(matches!(result, Err(StoreError::UnsupportedMigration { .. })));
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn test_timestamp_backfill_keeps_milliseconds() {
        let records = sample_records();
        let mut conn = v0_with_rows(&records);
        migrate(&mut conn, INITIAL_VERSION, LATEST_VERSION).unwrap();

        let rows = snapshot(&conn);
        for (row, record) in rows.iter().zip(&records) {
            // SQLite may round the sub-millisecond part
            assert!((row.5 - record.created_at.timestamp_millis()).abs() <= 1);
        }
    }

    #[test]
    fn test_reset_leaves_empty_latest_schema() {
        let mut conn = v0_with_rows(&sample_records());
        reset(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
        assert!(snapshot(&conn).is_empty());
    }
}
