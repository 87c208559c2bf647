#![forbid(unsafe_code)]

mod draft_locks;
mod error;
mod jobs;
mod runs;
mod support;
mod types;

pub use error::StoreError;
pub use draft_locks::DEFAULT_DRAFT_LOCK_TTL_MS;
pub use types::*;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use support::*;

pub const DB_FILE_NAME: &str = "toolrun.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable store for runs, the job queue and draft locks.
///
/// One `SqliteStore` wraps one connection; concurrent workers each open their own store on
/// the same directory and coordinate only through SQLite locking.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let db_path = storage_dir.join(DB_FILE_NAME);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;

        install_schema(&conn)?;

        Ok(Self { conn, storage_dir })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Write transactions take the database write lock up front, so a read-then-update
    /// inside them cannot interleave with another connection's.
    fn write_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

fn normalize_required_text(
    raw: &str,
    max_len: usize,
    empty: &'static str,
    too_long: &'static str,
) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidInput(empty));
    }
    if trimmed.len() > max_len {
        return Err(StoreError::InvalidInput(too_long));
    }
    Ok(trimmed.to_string())
}
