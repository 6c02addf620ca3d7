//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Components call store methods and never execute SQL directly.
//! Every mutation of shared counters or records is a single statement
//! (atomic upsert, conditional UPDATE or compare-and-swap on `version`).
//! A record write and the metric and event that go with it share one
//! `in_transaction` call.

use crate::{error::SimResult, event::EventLogEntry};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, Transaction, TransactionBehavior};
use std::time::Duration;

mod metrics;
mod owner;
mod simulation;

pub use owner::OwnerQuotaRow;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SimStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl SimStore {
    pub fn open(path: &str) -> SimResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // Concurrent writers wait on each other instead of failing fast.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> SimResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SimResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_simulations.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_metrics.sql"))?;
        Ok(())
    }

    /// Run `f` inside one IMMEDIATE transaction on this connection.
    ///
    /// Every store call `f` makes commits together or not at all; an `Err`
    /// from `f` rolls back. The write lock is taken up front, so a version
    /// check inside `f` cannot lose to another connection. Not reentrant.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Self) -> SimResult<T>) -> SimResult<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> SimResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (simulation_id, event_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.simulation_id.as_deref(),
                entry.event_type,
                entry.payload,
                ts_to_sql(&entry.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_simulation(&self, simulation_id: &str) -> SimResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, simulation_id, event_type, payload, created_at
             FROM event_log WHERE simulation_id = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![simulation_id], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    simulation_id: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: ts_from_sql(4, row.get(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, event_type: &str) -> SimResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
                params![event_type],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

// ── Column codecs ──────────────────────────────────────────────────
//
// Timestamps are stored as fixed-width RFC 3339 UTC strings so that
// lexicographic comparison in SQL matches chronological order.

pub(crate) fn ts_to_sql(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_ts_from_sql(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| ts_from_sql(idx, r)).transpose()
}

pub(crate) fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn date_from_sql(idx: usize, raw: String) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn json_from_sql<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: String,
) -> rusqlite::Result<T> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
