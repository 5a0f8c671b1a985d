//! Durable table snapshots
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── ssl_certificate.json   # Certificate table
//! ├── service.json           # Upstream sets
//! └── config.json            # Account and certificate keys
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace};

use super::Row;

/// All rows of one table, ordered by key
pub type TableSnapshot = BTreeMap<String, Row>;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence backend for tables
pub trait TableStorage: Send + Sync {
    /// Last saved snapshot of a table, if any.
    fn load(&self, table: &str) -> Result<Option<TableSnapshot>, StorageError>;

    /// Replace the stored snapshot of a table.
    fn save(&self, table: &str, snapshot: &TableSnapshot) -> Result<(), StorageError>;
}

/// One JSON file per table under a private directory
///
/// Snapshots are written to a temporary file and renamed into place.
#[derive(Debug)]
pub struct FileTableStorage {
    base_path: PathBuf,
}

impl FileTableStorage {
    /// Create the storage directory (0700 on Unix).
    pub fn new(base_path: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(base_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(base_path, fs::Permissions::from_mode(0o700))?;
        }

        info!(
            storage_path = %base_path.display(),
            "Initialized table storage"
        );

        Ok(Self {
            base_path: base_path.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", table))
    }
}

impl TableStorage for FileTableStorage {
    fn load(&self, table: &str) -> Result<Option<TableSnapshot>, StorageError> {
        let path = self.table_path(table);
        if !path.exists() {
            trace!(table = %table, "No stored snapshot");
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let snapshot: TableSnapshot = serde_json::from_str(&content)?;
        debug!(table = %table, rows = snapshot.len(), "Loaded table snapshot");
        Ok(Some(snapshot))
    }

    fn save(&self, table: &str, snapshot: &TableSnapshot) -> Result<(), StorageError> {
        let path = self.table_path(table);
        let tmp = self.base_path.join(format!(".{}.json.tmp", table));

        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        // Rows hold private keys.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)?;

        trace!(table = %table, rows = snapshot.len(), "Saved table snapshot");
        Ok(())
    }
}

/// Process-local storage; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryTableStorage {
    snapshots: Mutex<HashMap<String, TableSnapshot>>,
}

impl MemoryTableStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStorage for MemoryTableStorage {
    fn load(&self, table: &str) -> Result<Option<TableSnapshot>, StorageError> {
        Ok(self.snapshots.lock().get(table).cloned())
    }

    fn save(&self, table: &str, snapshot: &TableSnapshot) -> Result<(), StorageError> {
        self.snapshots
            .lock()
            .insert(table.to_string(), snapshot.clone());
        Ok(())
    }
}
