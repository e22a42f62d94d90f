//! SQLite-backed dedup store for listing records.
//!
//! The unique constraint over the dedup key does the deduplication; inserts
//! use `INSERT OR IGNORE` so a repeated key is a counted outcome, not an error.

use std::path::Path;

use rusqlite::{Connection, params};
use thiserror::Error;
use tracing::debug;

use crate::record::ListingRecord;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS knives (
    knife_type TEXT NOT NULL,
    knife_skin TEXT NOT NULL,
    knife_skin_quality TEXT NOT NULL,
    stattrak INTEGER NOT NULL,
    price_usd REAL NOT NULL,
    quantity INTEGER NOT NULL,
    CONSTRAINT knife_cons UNIQUE (knife_type, knife_skin, knife_skin_quality, stattrak)
)";

const INSERT: &str = "INSERT OR IGNORE INTO knives
    (knife_type, knife_skin, knife_skin_quality, stattrak, price_usd, quantity)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("store query failed: {0}")]
    Sql(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Accepted,
    Duplicate,
}

pub trait ListingStore {
    fn insert(&mut self, record: &ListingRecord) -> Result<InsertOutcome, StoreError>;

    /// Rows currently persisted.
    fn total(&self) -> Result<u64, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) the database file and declares the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(SCHEMA, [])?;
        debug!("knives schema declared");
        Ok(Self { conn })
    }

    /// Releases the connection, surfacing any close failure.
    pub fn close(self) -> Result<(), StoreError> {
        self.conn.close().map_err(|(_, e)| StoreError::Sql(e))
    }
}

impl ListingStore for SqliteStore {
    fn insert(&mut self, record: &ListingRecord) -> Result<InsertOutcome, StoreError> {
        let changed = self.conn.execute(
            INSERT,
            params![
                record.item_type,
                record.skin_name,
                record.skin_quality,
                record.is_special_track,
                record.price_usd,
                record.quantity,
            ],
        )?;
        Ok(if changed == 1 {
            InsertOutcome::Accepted
        } else {
            InsertOutcome::Duplicate
        })
    }

    fn total(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM knives", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}
