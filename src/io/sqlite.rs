//! SQLite row store.
//!
//! Valid readings are kept in `co2_readings(ts, aula, co2_ppm, stored_at)`
//! with a `UNIQUE (ts, aula)` constraint. Writes use `INSERT OR IGNORE` inside
//! one transaction per batch, so a replayed batch inserts nothing and a failed
//! batch leaves no partial rows behind.
//!
//! The store also serves the read-side query contract the report needs:
//! [`SqliteRowStore::readings_ordered`] and [`SqliteRowStore::count`].

use crate::reading::{NaturalKey, Reading};
use crate::sink::RowSink;
use anyhow::{Context, Result};
use chrono::Local;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::fs::create_dir_all;
use std::path::Path;
use tracing::{debug, info};

const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS co2_readings (
    ts        TEXT    NOT NULL,
    aula      TEXT    NOT NULL,
    co2_ppm   INTEGER NOT NULL,
    stored_at TEXT    NOT NULL,
    UNIQUE (ts, aula)
);

CREATE INDEX IF NOT EXISTS idx_co2_readings_ts ON co2_readings(ts);
";

const INSERT_SQL: &str = "INSERT OR IGNORE INTO co2_readings (ts, aula, co2_ppm, stored_at)
     VALUES (?1, ?2, ?3, ?4)";

/// A persisted reading with its ingestion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowStoreRecord {
    pub reading: Reading,
    /// Local wall-clock time the row was first inserted.
    pub stored_at: String,
}

/// `co2_readings` backed by a SQLite database.
pub struct SqliteRowStore {
    conn: Connection,
}

impl SqliteRowStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).with_context(|| format!("mkdir -p {}", parent.display()))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let store = Self::with_connection(conn)?;
        info!(path = %path.display(), rows = store.count()?, "row store opened");
        Ok(store)
    }

    /// Private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        Ok(Self { conn })
    }

    /// Number of stored rows.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM co2_readings", [], |row| row.get(0))
            .context("count co2_readings")?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Every stored reading ordered by `ts`, then `aula`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn readings_ordered(&self) -> Result<Vec<Reading>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ts, aula, co2_ppm FROM co2_readings ORDER BY ts, aula")
            .context("prepare ordered scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Reading {
                    ts: row.get(0)?,
                    aula: row.get(1)?,
                    co2_ppm: row.get(2)?,
                })
            })
            .context("scan co2_readings")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("decode co2_readings row")
    }

    /// Look up one row by natural key.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn get(&self, key: &NaturalKey) -> Result<Option<RowStoreRecord>> {
        self.conn
            .query_row(
                "SELECT ts, aula, co2_ppm, stored_at FROM co2_readings WHERE ts = ?1 AND aula = ?2",
                params![key.ts, key.aula],
                |row| {
                    Ok(RowStoreRecord {
                        reading: Reading {
                            ts: row.get(0)?,
                            aula: row.get(1)?,
                            co2_ppm: row.get(2)?,
                        },
                        stored_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("lookup {key}"))
    }
}

impl RowSink for SqliteRowStore {
    fn insert_new(&mut self, readings: &[Reading]) -> Result<usize> {
        if readings.is_empty() {
            return Ok(0);
        }
        let stored_at = Local::now()
            .naive_local()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string();

        let tx = self
            .conn
            .transaction()
            .context("begin row store transaction")?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL).context("prepare insert")?;
            for r in readings {
                inserted += stmt
                    .execute(params![r.ts, r.aula, r.co2_ppm, stored_at])
                    .with_context(|| format!("insert ({}, {})", r.ts, r.aula))?;
            }
        }
        tx.commit().context("commit row store transaction")?;

        debug!(
            submitted = readings.len(),
            inserted,
            ignored = readings.len() - inserted,
            "row store insert-or-ignore"
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_natural_keys_are_ignored() {
        let mut store = SqliteRowStore::open_in_memory().unwrap();
        let a = Reading::new("2024-01-01T00:00:00", "aula_101", 500);
        let a_changed = Reading::new("2024-01-01T00:00:00", "aula_101", 999);
        let b = Reading::new("2024-01-01T00:00:00", "aula_102", 700);

        assert_eq!(store.insert_new(&[a.clone(), b.clone()]).unwrap(), 2);
        assert_eq!(store.insert_new(&[a.clone(), a_changed]).unwrap(), 0);
        assert_eq!(store.count().unwrap(), 2);

        let kept = store.get(&a.natural_key()).unwrap().unwrap();
        assert_eq!(kept.reading.co2_ppm, 500);
        assert!(!kept.stored_at.is_empty());
    }

    #[test]
    fn ordered_scan() {
        let mut store = SqliteRowStore::open_in_memory().unwrap();
        store
            .insert_new(&[
                Reading::new("2024-01-01T00:00:30", "a", 3),
                Reading::new("2024-01-01T00:00:00", "a", 1),
                Reading::new("2024-01-01T00:00:15", "a", 2),
            ])
            .unwrap();
        let ppm: Vec<i64> = store
            .readings_ordered()
            .unwrap()
            .iter()
            .map(|r| r.co2_ppm)
            .collect();
        assert_eq!(ppm, vec![1, 2, 3]);
    }

    #[test]
    fn reopening_keeps_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("db").join("events.sqlite");
        {
            let mut store = SqliteRowStore::open(&path).unwrap();
            store
                .insert_new(&[Reading::new("2024-01-01T00:00:00", "a", 600)])
                .unwrap();
        }
        let mut store = SqliteRowStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(
            store
                .insert_new(&[Reading::new("2024-01-01T00:00:00", "a", 600)])
                .unwrap(),
            0
        );
    }
}
