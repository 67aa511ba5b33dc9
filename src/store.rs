//! Persistent ordered store (C1).
//!
//! A single named map inside `redb`, the embedded, crash-safe, ordered
//! B-tree KV engine this pack's `topgun-server` depends on for the same
//! reason: a durable, ordered, single-file store with no external process.
//!
//! Keys are a strictly increasing `u64` counter allocated at `append`;
//! they define FIFO order. On reopen the next key is recovered as
//! `max(existing) + 1`, or `0` if the map is empty.

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};

#[cfg(unix)]
fn is_out_of_space(io_err: &std::io::Error) -> bool {
    io_err.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(not(unix))]
fn is_out_of_space(io_err: &std::io::Error) -> bool {
    io_err.kind() == std::io::ErrorKind::Other && io_err.to_string().contains("space")
}

/// Walks an error's `source()` chain looking for an underlying `io::Error`,
/// so the store can distinguish `NO_SPACE` from any other I/O failure
/// regardless of which redb error variant wraps it.
fn classify<E: std::error::Error + 'static>(err: E) -> Error {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = cause {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            if is_out_of_space(io_err) {
                return Error::NoSpace;
            }
        }
        cause = e.source();
    }
    Error::Io(err.to_string())
}

/// Persistent, ordered, crash-durable spill store.
pub struct SpillStore {
    db: Arc<Database>,
    table_name: String,
    next_key: AtomicU64,
}

impl SpillStore {
    /// Opens or creates the map `name` under `path`, recovering `next_key`.
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(classify)?;
        let table_name = name.into();

        let next_key = {
            let read_txn = db.begin_read().map_err(classify)?;
            let table_def: TableDefinition<u64, &[u8]> = TableDefinition::new(&table_name);
            match read_txn.open_table(table_def) {
                Ok(table) => match table.last().map_err(classify)? {
                    Some((k, _v)) => k.value() + 1,
                    None => 0,
                },
                Err(redb::TableError::TableDoesNotExist(_)) => 0,
                Err(e) => return Err(classify(e)),
            }
        };

        Ok(Self {
            db: Arc::new(db),
            table_name,
            next_key: AtomicU64::new(next_key),
        })
    }

    /// Assigns the next key and durably appends `bytes`, returning the key.
    pub async fn append(&self, bytes: Vec<u8>) -> Result<u64> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let db = Arc::clone(&self.db);
        let table_name = self.table_name.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let table_def: TableDefinition<u64, &[u8]> = TableDefinition::new(&table_name);
            let write_txn = db.begin_write().map_err(classify)?;
            {
                let mut table = write_txn.open_table(table_def).map_err(classify)?;
                table.insert(key, bytes.as_slice()).map_err(classify)?;
            }
            write_txn.commit().map_err(classify)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))??;

        Ok(key)
    }

    /// Returns the least key without removing it.
    pub async fn peek_oldest(&self) -> Result<Option<(u64, Vec<u8>)>> {
        self.peek_after(None).await
    }

    /// Returns the least key strictly greater than `after`, without removing
    /// it. Used by the pump's dispatch cursor (SPEC_FULL §4.6) so it never
    /// re-offers an entry that is still present but already in flight.
    pub async fn peek_after(&self, after: Option<u64>) -> Result<Option<(u64, Vec<u8>)>> {
        let db = Arc::clone(&self.db);
        let table_name = self.table_name.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<(u64, Vec<u8>)>> {
            let table_def: TableDefinition<u64, &[u8]> = TableDefinition::new(&table_name);
            let read_txn = db.begin_read().map_err(classify)?;
            let table = match read_txn.open_table(table_def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(classify(e)),
            };

            let lower = match after {
                Some(k) => Bound::Excluded(k),
                None => Bound::Unbounded,
            };
            let mut range = table.range((lower, Bound::Unbounded)).map_err(classify)?;
            match range.next() {
                Some(entry) => {
                    let (k, v) = entry.map_err(classify)?;
                    Ok(Some((k.value(), v.value().to_vec())))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))?
    }

    /// Returns every entry, in ascending key order. Used once at `start()` to
    /// recover retry-pending entries into the in-memory scheduler.
    pub async fn iter(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let db = Arc::clone(&self.db);
        let table_name = self.table_name.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<(u64, Vec<u8>)>> {
            let table_def: TableDefinition<u64, &[u8]> = TableDefinition::new(&table_name);
            let read_txn = db.begin_read().map_err(classify)?;
            let table = match read_txn.open_table(table_def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(classify(e)),
            };

            let mut out = Vec::with_capacity(table.len().map_err(classify)? as usize);
            for entry in table.iter().map_err(classify)? {
                let (k, v) = entry.map_err(classify)?;
                out.push((k.value(), v.value().to_vec()));
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))?
    }

    /// Durably deletes `key`. A no-op if the key is already gone.
    pub async fn remove(&self, key: u64) -> Result<()> {
        let db = Arc::clone(&self.db);
        let table_name = self.table_name.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let table_def: TableDefinition<u64, &[u8]> = TableDefinition::new(&table_name);
            let write_txn = db.begin_write().map_err(classify)?;
            {
                let mut table = write_txn.open_table(table_def).map_err(classify)?;
                table.remove(key).map_err(classify)?;
            }
            write_txn.commit().map_err(classify)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))?
    }

    /// Current entry count.
    pub async fn size(&self) -> Result<u64> {
        let db = Arc::clone(&self.db);
        let table_name = self.table_name.clone();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            let table_def: TableDefinition<u64, &[u8]> = TableDefinition::new(&table_name);
            let read_txn = db.begin_read().map_err(classify)?;
            match read_txn.open_table(table_def) {
                Ok(table) => table.len().map_err(classify),
                Err(redb::TableError::TableDoesNotExist(_)) => Ok(0),
                Err(e) => Err(classify(e)),
            }
        })
        .await
        .map_err(|e| Error::Io(e.to_string()))?
    }

    /// Releases the store. redb fsyncs on every commit, so there is nothing
    /// left to flush here beyond dropping the handle.
    pub fn close(self) {
        drop(self);
    }
}
