//! StateStore — redb-backed state persistence for Turing.
//!
//! This module owns the database handle and the helpers shared by the
//! per-entity modules (`routers`, `versions`, `events`, `jobs`), which add
//! their operations as further `impl StateStore` blocks. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// `map_err!(Variant)` wraps a redb error's message in `StateError::Variant`.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

pub(crate) type RecordTable = TableDefinition<'static, u64, &'static [u8]>;

/// Shared handle to the router, version, event and job tables.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open the store file at `path`, creating it and its tables if needed.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// A store that lives as long as its last clone. Used by tests.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [ROUTERS, ROUTER_VERSIONS, ENRICHERS, ENSEMBLERS, EVENTS, ENSEMBLING_JOBS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(ROUTER_NAMES).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read one record by id in its own read transaction.
    pub(crate) fn read_record<T: DeserializeOwned>(
        &self,
        def: RecordTable,
        id: u64,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_record(&table, id)
    }

    /// Read every record of a table, in id order.
    pub(crate) fn read_all<T: DeserializeOwned>(&self, def: RecordTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_records(&table)
    }
}

/// Fetch and decode a record from an open table.
pub(crate) fn get_record<T, R>(table: &R, id: u64) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every record of an open table, in id order.
pub(crate) fn scan_records<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<u64, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

/// Encode and write a record into an open table.
pub(crate) fn put_record<T: Serialize>(
    table: &mut redb::Table<'_, u64, &'static [u8]>,
    id: u64,
    value: &T,
) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(id, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Advance a named sequence and return its new value. Sequences start at 1.
pub(crate) fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

pub(crate) fn not_found(kind: &str, id: u64) -> StateError {
    StateError::NotFound(format!("{kind} {id}"))
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
