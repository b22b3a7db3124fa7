//! In-memory collaborators for exercising the runners without a database.
//!
//! [`MemoryStore`] understands the tracking-table statements the relational
//! runner issues and records every other script it is asked to execute.
//! Transactions work on a snapshot that replaces the store state on commit.
//! [`MemoryDocumentStore`] keeps collections as vectors of documents.
//!
//! Both can be told to fail specific operations.

use crate::document::{Document, DocumentCursor, DocumentStore, Filter, FindCallback, FindOptions};
use crate::executor::{
    SqlExecutor, SqlRow, SqlValue, StoreError, StoreTransaction, TransactionalStore,
};
use crate::migration::state_table::{
    CREATE_TABLE_SQL, DELETE_FROM_VERSION_SQL, INSERT_VERSION_SQL, SELECT_ALL_SQL,
    SELECT_LATEST_SQL, TRUNCATE_SQL,
};
use crate::migration::TABLE_NAME;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// `None` until the tracking table is created
    versions: Option<Vec<i64>>,
    executed: Vec<String>,
}

#[derive(Debug, Default)]
struct Faults {
    markers: Vec<String>,
    commit: bool,
    rollback: bool,
    reads: bool,
    exists: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn table_missing() -> StoreError {
    StoreError::Query(format!("relation \"{TABLE_NAME}\" does not exist"))
}

/// In-memory `TransactionalStore`
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    /// Store without a tracking table
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose tracking table already holds `versions`
    pub fn with_table(versions: &[i64]) -> Self {
        let store = Self::new();
        lock(&store.state).versions = Some(versions.to_vec());
        store
    }

    /// Recorded versions in insertion order, `None` if the table is absent
    pub fn versions(&self) -> Option<Vec<i64>> {
        lock(&self.state).versions.clone()
    }

    /// Committed scripts other than tracking-table statements, in order
    pub fn executed(&self) -> Vec<String> {
        lock(&self.state).executed.clone()
    }

    /// Fail any statement containing `marker`
    pub fn fail_on(&self, marker: impl Into<String>) {
        lock(&self.faults).markers.push(marker.into());
    }

    pub fn fail_commit(&self) {
        lock(&self.faults).commit = true;
    }

    pub fn fail_rollback(&self) {
        lock(&self.faults).rollback = true;
    }

    /// Fail every read of the tracking table
    pub fn fail_reads(&self) {
        lock(&self.faults).reads = true;
    }

    /// Fail table existence probes
    pub fn fail_exists(&self) {
        lock(&self.faults).exists = true;
    }

    fn run(&self, state: &mut MemoryState, sql: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        if let Some(marker) = lock(&self.faults)
            .markers
            .iter()
            .find(|m| sql.contains(m.as_str()))
        {
            return Err(StoreError::Query(format!(
                "injected failure on '{marker}' executing: {sql}"
            )));
        }

        let version = || {
            params
                .first()
                .and_then(SqlValue::as_i64)
                .ok_or_else(|| StoreError::Query("missing version parameter".into()))
        };

        if sql == CREATE_TABLE_SQL.as_str() {
            if state.versions.is_some() {
                return Err(StoreError::Query(format!(
                    "relation \"{TABLE_NAME}\" already exists"
                )));
            }
            state.versions = Some(Vec::new());
            return Ok(0);
        }

        match sql {
            INSERT_VERSION_SQL => {
                let version = version()?;
                state.versions.as_mut().ok_or_else(table_missing)?.push(version);
                Ok(1)
            }
            DELETE_FROM_VERSION_SQL => {
                let version = version()?;
                let versions = state.versions.as_mut().ok_or_else(table_missing)?;
                let before = versions.len();
                versions.retain(|v| *v < version);
                Ok((before - versions.len()) as u64)
            }
            TRUNCATE_SQL => {
                state.versions.as_mut().ok_or_else(table_missing)?.clear();
                Ok(0)
            }
            script => {
                state.executed.push(script.to_string());
                Ok(0)
            }
        }
    }

    fn query(&self, state: &MemoryState, sql: &str) -> Result<Vec<SqlRow>, StoreError> {
        if lock(&self.faults).reads {
            return Err(StoreError::Query("injected read failure".into()));
        }

        let mut versions = state.versions.clone().ok_or_else(table_missing)?;
        match sql {
            SELECT_LATEST_SQL => versions.sort_unstable_by(|a, b| b.cmp(a)),
            SELECT_ALL_SQL => versions.sort_unstable(),
            other => return Err(StoreError::Query(format!("unsupported query: {other}"))),
        }

        Ok(versions
            .into_iter()
            .map(|v| SqlRow::new(vec![SqlValue::BigInt(v)]))
            .collect())
    }
}

impl SqlExecutor for MemoryStore {
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        let mut state = lock(&self.state).clone();
        let affected = self.run(&mut state, query, params)?;
        *lock(&self.state) = state;
        Ok(affected)
    }

    fn batch_execute(&self, script: &str) -> Result<(), StoreError> {
        self.execute(script, &[]).map(|_| ())
    }

    fn raw_query(&self, query: &str, _params: &[SqlValue]) -> Result<Vec<SqlRow>, StoreError> {
        let state = lock(&self.state).clone();
        self.query(&state, query)
    }
}

impl TransactionalStore for MemoryStore {
    fn exists(&self, name: &str) -> Result<bool, StoreError> {
        if lock(&self.faults).exists {
            return Err(StoreError::Query(format!("injected failure probing {name}")));
        }
        Ok(name == TABLE_NAME && lock(&self.state).versions.is_some())
    }

    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            state: RefCell::new(lock(&self.state).clone()),
        }))
    }
}

/// Snapshot transaction over a [`MemoryStore`]
struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    state: RefCell<MemoryState>,
}

impl SqlExecutor for MemoryTransaction<'_> {
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, StoreError> {
        self.store.run(&mut self.state.borrow_mut(), query, params)
    }

    fn batch_execute(&self, script: &str) -> Result<(), StoreError> {
        self.execute(script, &[]).map(|_| ())
    }

    fn raw_query(&self, query: &str, _params: &[SqlValue]) -> Result<Vec<SqlRow>, StoreError> {
        self.store.query(&self.state.borrow(), query)
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if lock(&self.store.faults).commit {
            return Err(StoreError::Other("injected commit failure".into()));
        }
        let store = self.store;
        let state = self.state.into_inner();
        *lock(&store.state) = state;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if lock(&self.store.faults).rollback {
            return Err(StoreError::Other("injected rollback failure".into()));
        }
        Ok(())
    }
}

/// In-memory `DocumentStore`
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_reads: Mutex<bool>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents of `collection` in insertion order
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.collections)
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Fail inserts into and deletes from `collection`
    pub fn fail_writes_to(&self, collection: impl Into<String>) {
        lock(&self.failing_writes).insert(collection.into());
    }

    /// Deliver an error to every `find` callback
    pub fn fail_reads(&self) {
        *lock(&self.failing_reads) = true;
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn insert_one(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        if lock(&self.failing_writes).contains(collection) {
            return Err(StoreError::Other(format!(
                "injected write failure on {collection}"
            )));
        }
        lock(&self.collections)
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        if lock(&self.failing_writes).contains(collection) {
            return Err(StoreError::Other(format!(
                "injected write failure on {collection}"
            )));
        }
        let mut collections = lock(&self.collections);
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|d| !filter.matches(d));
        Ok((before - documents.len()) as u64)
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
        callback: &mut FindCallback<'_>,
    ) -> Result<(), StoreError> {
        if *lock(&self.failing_reads) {
            return callback(Err(StoreError::Other(format!(
                "injected read failure on {collection}"
            ))));
        }

        let mut documents: Vec<Document> = self
            .documents(collection)
            .into_iter()
            .filter(|d| filter.matches(d))
            .collect();
        options.apply(&mut documents);
        callback(Ok(DocumentCursor::new(documents)))
    }
}
