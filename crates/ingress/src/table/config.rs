//! Config table: small named values such as persisted keys

use std::sync::Arc;
use wharf_config::TableConfig;

use super::{Column, Table, TableError, TableStorage, Value};

pub const TABLE_NAME: &str = "config";

/// ACME account key, PKCS#8 PEM
pub const ACME_ACCOUNT_KEY: &str = "acme.account_key";

/// Certificate key pair shared by every issued certificate, PEM
pub const SSL_PRIVATE_KEY: &str = "ssl.private_key";

const VALUE: &str = "value";

#[derive(Debug)]
pub struct ConfigTable {
    table: Table,
}

impl ConfigTable {
    pub fn open(config: &TableConfig, storage: Arc<dyn TableStorage>) -> Result<Self, TableError> {
        let table = Table::open(
            TABLE_NAME,
            vec![Column::string(VALUE, config.config_value_size)],
            config.config_rows,
            storage,
        )?;
        Ok(Self { table })
    }

    pub fn exist(&self, key: &str) -> bool {
        self.table.exist(key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.table
            .get(key, VALUE)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), TableError> {
        self.table.set(key, [(VALUE, Value::from(value))])
    }

    /// Stored value, or the result of `init` stored under `key`.
    pub fn get_or_insert_with<F, E>(&self, key: &str, init: F) -> Result<String, E>
    where
        F: FnOnce() -> Result<String, E>,
        E: From<TableError>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = init()?;
        self.set(key, &value)?;
        Ok(value)
    }
}
