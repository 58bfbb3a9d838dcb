//! Spool for undeliverable batches
//!
//! Uses SQLite so that transactions survive a restart while the backend is
//! down. Rows are read in insertion order and deleted only once the replayed
//! batch has been accepted.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};
use wiretap_core::transaction::Transaction;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SpoolResult<T> = Result<T, SpoolError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS spooled_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document TEXT NOT NULL,
    spooled_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
)";

/// Transactions read back from the spool
#[derive(Debug, Default)]
pub struct SpooledBatch {
    /// Row ids, to delete once delivered
    pub ids: Vec<i64>,
    pub transactions: Vec<Transaction>,
}

impl SpooledBatch {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// What a store call did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub inserted: usize,
    /// Oldest rows removed to stay under the size cap
    pub evicted: usize,
}

/// SQLite-backed spool
pub struct Spool {
    conn: Mutex<Connection>,
    max_events: usize,
}

impl Spool {
    /// Open (or create) the spool database at `path`
    pub fn open(path: impl AsRef<Path>, max_events: usize) -> SpoolResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute(SCHEMA, [])?;
        info!(path = %path.display(), "Spool opened");

        Ok(Self {
            conn: Mutex::new(conn),
            max_events: max_events.max(1),
        })
    }

    /// In-memory spool (tests, or when no path is writable)
    pub fn in_memory(max_events: usize) -> SpoolResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_events: max_events.max(1),
        })
    }

    /// Append transactions, evicting the oldest rows beyond the cap
    pub fn store(&self, transactions: &[Transaction]) -> SpoolResult<Stored> {
        if transactions.is_empty() {
            return Ok(Stored::default());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO spooled_transactions (document) VALUES (?)")?;
            for transaction in transactions {
                stmt.execute(params![serde_json::to_string(transaction)?])?;
            }
        }

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM spooled_transactions", [], |row| row.get(0))?;
        let excess = (count as usize).saturating_sub(self.max_events);
        if excess > 0 {
            tx.execute(
                "DELETE FROM spooled_transactions WHERE id IN
                 (SELECT id FROM spooled_transactions ORDER BY id ASC LIMIT ?)",
                params![excess as i64],
            )?;
            warn!(evicted = excess, max = self.max_events, "Spool full, dropped oldest transactions");
        }
        tx.commit()?;

        debug!(count = transactions.len(), "Spooled transactions");
        Ok(Stored {
            inserted: transactions.len(),
            evicted: excess,
        })
    }

    /// Oldest `limit` transactions, left in place
    pub fn peek(&self, limit: usize) -> SpoolResult<SpooledBatch> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, document FROM spooled_transactions ORDER BY id ASC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut batch = SpooledBatch::default();
        let mut corrupt = Vec::new();
        for row in rows {
            let (id, document) = row?;
            match serde_json::from_str::<Transaction>(&document) {
                Ok(transaction) => {
                    batch.ids.push(id);
                    batch.transactions.push(transaction);
                }
                Err(e) => {
                    warn!(id, error = %e, "Discarding unreadable spooled transaction");
                    corrupt.push(id);
                }
            }
        }
        drop(stmt);

        if !corrupt.is_empty() {
            delete_ids(&conn, &corrupt)?;
        }
        Ok(batch)
    }

    /// Delete delivered rows
    pub fn remove(&self, ids: &[i64]) -> SpoolResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        delete_ids(&conn, ids)
    }

    pub fn len(&self) -> SpoolResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM spooled_transactions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> SpoolResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn delete_ids(conn: &Connection, ids: &[i64]) -> SpoolResult<usize> {
    let placeholders = vec!["?"; ids.len()].join(",");
    let sql = format!("DELETE FROM spooled_transactions WHERE id IN ({})", placeholders);
    let deleted = conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
    Ok(deleted)
}
