//! The embedded bucketed, transactional, single-writer key-value store
//! (`spec.md` §4.B). Backed by `redb`: many concurrent read transactions,
//! one write transaction at a time, enforced by `redb::Database` itself.
//!
//! This module is deliberately thin — a generic JSON-bucket helper plus a
//! transaction-scoped handle for callers (the local index, the OAuth store)
//! that need several buckets updated atomically. Callers own their bucket
//! layout via [`tables`]; this module owns only "how do I get bytes in and
//! out of redb without boilerplate at every call site."

pub mod tables;

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Kv {
    db: Arc<Database>,
}

impl Kv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref())
            .map_err(|e| Error::Internal(format!("opening {}: {e}", path.as_ref().display())))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory database for tests; avoids a tempfile per test case.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|e| Error::Internal(e.to_string()))?;
        let path = dir.path().join("test.redb");
        let kv = Self::open(path)?;
        // Leak the tempdir so it outlives the returned Kv; tests are short-lived
        // processes and this keeps the call site simple.
        std::mem::forget(dir);
        Ok(kv)
    }

    pub fn get_json<V: DeserializeOwned>(
        &self,
        table: TableDefinition<'_, &str, &str>,
        key: &str,
    ) -> Result<Option<V>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let t = match txn.open_table(table) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(Error::Internal(e.to_string())),
        };
        let Some(guard) = t.get(key).map_err(|e| Error::Internal(e.to_string()))? else {
            return Ok(None);
        };
        let value: V = serde_json::from_str(guard.value()).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Some(value))
    }

    pub fn put_json<V: Serialize>(
        &self,
        table: TableDefinition<'_, &str, &str>,
        key: &str,
        value: &V,
    ) -> Result<()> {
        let json = serde_json::to_string(value).map_err(|e| Error::Internal(e.to_string()))?;
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Internal(e.to_string()))?;
        {
            let mut t = txn.open_table(table).map_err(|e| Error::Internal(e.to_string()))?;
            t.insert(key, json.as_str())
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        txn.commit().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, table: TableDefinition<'_, &str, &str>, key: &str) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Internal(e.to_string()))?;
        {
            let mut t = txn.open_table(table).map_err(|e| Error::Internal(e.to_string()))?;
            t.remove(key).map_err(|e| Error::Internal(e.to_string()))?;
        }
        txn.commit().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    /// Atomically read-then-delete, for one-shot consumption semantics
    /// (pending auth requests, PAR-style data): the pattern every
    /// `consume_*` operation in the spec (`AuthRequestState`,
    /// `PendingAuth`) needs.
    pub fn take_json<V: DeserializeOwned>(
        &self,
        table: TableDefinition<'_, &str, &str>,
        key: &str,
    ) -> Result<Option<V>> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let value = {
            let mut t = txn.open_table(table).map_err(|e| Error::Internal(e.to_string()))?;
            let existing = t.remove(key).map_err(|e| Error::Internal(e.to_string()))?;
            match existing {
                Some(guard) => {
                    Some(serde_json::from_str(guard.value()).map_err(|e| Error::Internal(e.to_string()))?)
                }
                None => None,
            }
        };
        txn.commit().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(value)
    }

    pub fn contains(&self, table: TableDefinition<'_, &str, &str>, key: &str) -> Result<bool> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let t = match txn.open_table(table) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(false),
            Err(e) => return Err(Error::Internal(e.to_string())),
        };
        Ok(t.get(key).map_err(|e| Error::Internal(e.to_string()))?.is_some())
    }

    pub fn mark(&self, table: TableDefinition<'_, &str, &str>, key: &str) -> Result<()> {
        self.put_json(table, key, &true)
    }

    /// Direct access to the underlying database for callers that need
    /// several buckets (including the byte-keyed `by_time` table) touched
    /// in one write transaction, e.g. [`crate::index::LocalIndex::put`].
    pub fn database(&self) -> &Database {
        &self.db
    }
}
