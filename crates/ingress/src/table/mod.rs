//! Bounded, fixed-schema concurrent tables
//!
//! Each table is a `DashMap` of rows keyed by string, with typed columns
//! whose byte capacity is fixed when the table is created. Writes are
//! persisted through a [`TableStorage`] backend.
//!
//! # Consistency
//!
//! Last write wins per key. Each `set` or `del` is one step: the capacity
//! check, the in-memory change and the snapshot save run under a single
//! writer lock, and a change whose save fails is rolled back. There are no
//! cross-key transactions, and compound read-modify-write sequences built
//! on top of a table are not atomic; callers rely on idempotent effects
//! instead.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

mod certificate;
mod config;
mod service;
mod storage;

pub use certificate::{CertificateRecord, CertificateTable};
pub use config::{ConfigTable, ACME_ACCOUNT_KEY, SSL_PRIVATE_KEY};
pub use service::ServiceTable;
pub use storage::{FileTableStorage, MemoryTableStorage, StorageError, TableSnapshot, TableStorage};

/// Table errors
#[derive(Debug, Error)]
pub enum TableError {
    #[error("table '{table}' is full ({max_rows} rows)")]
    CapacityExceeded { table: String, max_rows: usize },

    #[error("value for column '{column}' is {size} bytes, capacity is {max}")]
    ValueTooLarge {
        column: String,
        size: usize,
        max: usize,
    },

    #[error("table '{table}' has no column '{column}'")]
    UnknownColumn { table: String, column: String },

    #[error("column '{column}' expects {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
    },

    #[error("cannot encode column '{column}': {source}")]
    Encoding {
        column: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// JSON text of a structured cell value.
pub fn encode_json<T: Serialize + ?Sized>(column: &str, value: &T) -> Result<String, TableError> {
    serde_json::to_string(value).map_err(|source| TableError::Encoding {
        column: column.to_string(),
        source,
    })
}

/// Column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// UTF-8 string of at most `max_bytes`
    Str { max_bytes: usize },
    /// 64-bit signed integer
    Int,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

impl Column {
    pub const fn string(name: &'static str, max_bytes: usize) -> Self {
        Self {
            name,
            kind: ColumnKind::Str { max_bytes },
        }
    }

    pub const fn int(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Int,
        }
    }

    fn check(&self, value: &Value) -> Result<(), TableError> {
        match (self.kind, value) {
            (ColumnKind::Str { max_bytes }, Value::Str(s)) => {
                if s.len() > max_bytes {
                    Err(TableError::ValueTooLarge {
                        column: self.name.to_string(),
                        size: s.len(),
                        max: max_bytes,
                    })
                } else {
                    Ok(())
                }
            }
            (ColumnKind::Int, Value::Int(_)) => Ok(()),
            (ColumnKind::Str { .. }, _) => Err(TableError::TypeMismatch {
                column: self.name.to_string(),
                expected: "a string",
            }),
            (ColumnKind::Int, _) => Err(TableError::TypeMismatch {
                column: self.name.to_string(),
                expected: "an integer",
            }),
        }
    }
}

/// Cell value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// One row: column name -> value
pub type Row = BTreeMap<String, Value>;

/// A bounded, fixed-schema concurrent table
pub struct Table {
    name: &'static str,
    columns: Vec<Column>,
    max_rows: usize,
    rows: DashMap<String, Row>,
    storage: Arc<dyn TableStorage>,
    /// Held for the whole of a write, save included
    writer: Mutex<()>,
}

impl Table {
    /// Create a table and restore its rows from storage.
    ///
    /// Stored rows that no longer fit the schema are skipped.
    pub fn open(
        name: &'static str,
        columns: Vec<Column>,
        max_rows: usize,
        storage: Arc<dyn TableStorage>,
    ) -> Result<Self, TableError> {
        let table = Self {
            name,
            columns,
            max_rows,
            rows: DashMap::new(),
            storage,
            writer: Mutex::new(()),
        };

        if let Some(snapshot) = table.storage.load(name)? {
            for (key, row) in snapshot {
                if table.rows.len() >= max_rows {
                    warn!(table = name, key = %key, "Stored row beyond capacity, skipping");
                    continue;
                }
                match table.check_row(&row) {
                    Ok(()) => {
                        table.rows.insert(key, row);
                    }
                    Err(e) => {
                        warn!(table = name, key = %key, error = %e, "Stored row does not fit schema, skipping");
                    }
                }
            }
        }

        info!(
            table = name,
            rows = table.rows.len(),
            max_rows = max_rows,
            "Opened table"
        );
        Ok(table)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn exist(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    pub fn get(&self, key: &str, column: &str) -> Option<Value> {
        self.rows.get(key).and_then(|row| row.get(column).cloned())
    }

    pub fn get_row(&self, key: &str) -> Option<Row> {
        self.rows.get(key).map(|row| row.clone())
    }

    /// Write columns of a row, merging with any existing values.
    pub fn set<I, V>(&self, key: &str, values: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<Value>,
    {
        let mut update = Row::new();
        for (column, value) in values {
            let value = value.into();
            self.column(column)?.check(&value)?;
            update.insert(column.to_string(), value);
        }

        let _writer = self.writer.lock();
        let previous = self.get_row(key);
        if previous.is_none() && self.rows.len() >= self.max_rows {
            return Err(TableError::CapacityExceeded {
                table: self.name.to_string(),
                max_rows: self.max_rows,
            });
        }

        self.rows.entry(key.to_string()).or_default().extend(update);
        if let Err(e) = self.save() {
            self.restore(key, previous);
            return Err(e);
        }
        debug!(table = self.name, key = %key, "Row written");
        Ok(())
    }

    /// Delete a row. Returns whether it existed.
    pub fn del(&self, key: &str) -> Result<bool, TableError> {
        let _writer = self.writer.lock();
        let Some((_, previous)) = self.rows.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.save() {
            self.restore(key, Some(previous));
            return Err(e);
        }
        debug!(table = self.name, key = %key, "Row deleted");
        Ok(true)
    }

    /// Snapshot of every row, ordered by key.
    pub fn rows(&self) -> TableSnapshot {
        self.rows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column(&self, name: &str) -> Result<&Column, TableError> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TableError::UnknownColumn {
                table: self.name.to_string(),
                column: name.to_string(),
            })
    }

    fn check_row(&self, row: &Row) -> Result<(), TableError> {
        for (column, value) in row {
            self.column(column)?.check(value)?;
        }
        Ok(())
    }

    /// Save the current rows. Callers hold the writer lock.
    fn save(&self) -> Result<(), TableError> {
        let snapshot = self.rows();
        self.storage.save(self.name, &snapshot)?;
        Ok(())
    }

    /// Put back a row as it was before an unsaved write.
    fn restore(&self, key: &str, previous: Option<Row>) {
        warn!(table = self.name, key = %key, "Snapshot save failed, change rolled back");
        match previous {
            Some(row) => {
                self.rows.insert(key.to_string(), row);
            }
            None => {
                self.rows.remove(key);
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("rows", &self.rows.len())
            .field("max_rows", &self.max_rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max_rows: usize) -> Table {
        Table::open(
            "sample",
            vec![Column::string("name", 8), Column::int("count")],
            max_rows,
            Arc::new(MemoryTableStorage::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_set_merges_columns() {
        let table = table(4);
        table.set("a", [("name", Value::from("alpha"))]).unwrap();
        table.set("a", [("count", Value::from(3i64))]).unwrap();

        let row = table.get_row("a").unwrap();
        assert_eq!(row["name"], Value::from("alpha"));
        assert_eq!(row["count"], Value::Int(3));
        assert_eq!(table.get("a", "count").and_then(|v| v.as_int()), Some(3));
    }

    #[test]
    fn test_value_too_large_rejected() {
        let table = table(4);
        let err = table
            .set("a", [("name", "much too long")])
            .unwrap_err();
        assert!(matches!(
            err,
            TableError::ValueTooLarge { size: 13, max: 8, .. }
        ));
        assert!(!table.exist("a"));
    }

    #[test]
    fn test_capacity() {
        let table = table(2);
        table.set("a", [("count", 1i64)]).unwrap();
        table.set("b", [("count", 1i64)]).unwrap();
        assert!(matches!(
            table.set("c", [("count", 1i64)]),
            Err(TableError::CapacityExceeded { max_rows: 2, .. })
        ));
        // Existing keys can still be overwritten.
        table.set("a", [("count", 2i64)]).unwrap();
    }

    #[test]
    fn test_schema_checks() {
        let table = table(2);
        assert!(matches!(
            table.set("a", [("missing", 1i64)]),
            Err(TableError::UnknownColumn { .. })
        ));
        assert!(matches!(
            table.set("a", [("name", 1i64)]),
            Err(TableError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_del() {
        let table = table(2);
        table.set("a", [("count", 1i64)]).unwrap();
        assert!(table.del("a").unwrap());
        assert!(!table.del("a").unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_reopen_restores_rows_and_skips_invalid() {
        let storage = Arc::new(MemoryTableStorage::new());
        let mut snapshot = TableSnapshot::new();
        snapshot.insert(
            "good".to_string(),
            Row::from([("name".to_string(), Value::from("ok"))]),
        );
        snapshot.insert(
            "bad".to_string(),
            Row::from([("name".to_string(), Value::from("far too long"))]),
        );
        storage.save("sample", &snapshot).unwrap();

        let table = Table::open(
            "sample",
            vec![Column::string("name", 8)],
            4,
            storage,
        )
        .unwrap();
        assert!(table.exist("good"));
        assert!(!table.exist("bad"));
    }

    /// Storage whose saves fail while `failing` is set.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryTableStorage,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyStorage {
        fn fail(&self, failing: bool) {
            self.failing
                .store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl TableStorage for FlakyStorage {
        fn load(&self, table: &str) -> Result<Option<TableSnapshot>, StorageError> {
            self.inner.load(table)
        }

        fn save(&self, table: &str, snapshot: &TableSnapshot) -> Result<(), StorageError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(table, snapshot)
        }
    }

    fn flaky_table(max_rows: usize) -> (Table, Arc<FlakyStorage>) {
        let storage = Arc::new(FlakyStorage::default());
        let table = Table::open(
            "sample",
            vec![Column::string("name", 8), Column::int("count")],
            max_rows,
            Arc::clone(&storage) as Arc<dyn TableStorage>,
        )
        .unwrap();
        (table, storage)
    }

    #[test]
    fn test_failed_save_rolls_back_insert() {
        let (table, storage) = flaky_table(1);
        storage.fail(true);
        assert!(matches!(
            table.set("a", [("count", 1i64)]),
            Err(TableError::Storage(_))
        ));
        assert!(!table.exist("a"));
        assert!(table.is_empty());

        // The slot was not consumed.
        storage.fail(false);
        table.set("b", [("count", 2i64)]).unwrap();
        assert_eq!(storage.inner.load("sample").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_save_rolls_back_update_and_delete() {
        let (table, storage) = flaky_table(2);
        table
            .set("a", [("name", Value::from("alpha")), ("count", Value::from(1i64))])
            .unwrap();

        storage.fail(true);
        assert!(table.set("a", [("count", 9i64)]).is_err());
        assert_eq!(table.get("a", "count"), Some(Value::Int(1)));
        assert!(table.del("a").is_err());
        assert_eq!(table.get("a", "name"), Some(Value::from("alpha")));
    }

    #[test]
    fn test_concurrent_inserts_respect_capacity() {
        let table = Arc::new(table(8));
        let handles: Vec<_> = (0..32)
            .map(|n| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || table.set(&format!("k{}", n), [("count", n as i64)]))
            })
            .collect();
        let written = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(written, 8);
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn test_encode_json_reports_column() {
        assert_eq!(encode_json("upstream", &[1, 2]).unwrap(), "[1,2]");

        // JSON object keys must be strings.
        let bad = BTreeMap::from([(vec![1u8], 1u8)]);
        let err = encode_json("upstream", &bad).unwrap_err();
        assert!(matches!(err, TableError::Encoding { ref column, .. } if column == "upstream"));
    }

    #[test]
    fn test_writes_are_persisted() {
        let storage = Arc::new(MemoryTableStorage::new());
        let table = Table::open(
            "sample",
            vec![Column::int("count")],
            4,
            Arc::clone(&storage) as Arc<dyn TableStorage>,
        )
        .unwrap();
        table.set("a", [("count", 7i64)]).unwrap();

        let saved = storage.load("sample").unwrap().unwrap();
        assert_eq!(saved["a"]["count"], Value::Int(7));
    }
}
