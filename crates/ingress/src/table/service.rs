//! Service table: service identifier -> upstream set
//!
//! The set is stored as a JSON object mapping each upstream to `1`.
//! [`ServiceTable::add_upstream`] and [`ServiceTable::remove_upstream`]
//! are the only operations that change membership; a row exists exactly
//! while its set is non-empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use wharf_common::ServiceId;
use wharf_config::TableConfig;

use super::{encode_json, Column, Table, TableError, TableStorage, Value};

pub const TABLE_NAME: &str = "service";

const UPSTREAM: &str = "upstream";

/// Upstream sets by service
#[derive(Debug)]
pub struct ServiceTable {
    table: Table,
}

impl ServiceTable {
    pub fn open(config: &TableConfig, storage: Arc<dyn TableStorage>) -> Result<Self, TableError> {
        let table = Table::open(
            TABLE_NAME,
            vec![Column::string(UPSTREAM, config.upstream_size)],
            config.service_rows,
            storage,
        )?;
        Ok(Self { table })
    }

    pub fn exist(&self, id: &ServiceId) -> bool {
        self.table.exist(id.as_str())
    }

    /// Current upstreams of a service, empty if it has none.
    pub fn upstreams(&self, id: &ServiceId) -> BTreeSet<String> {
        let Some(encoded) = self.table.get(id.as_str(), UPSTREAM) else {
            return BTreeSet::new();
        };
        let Some(encoded) = encoded.as_str() else {
            return BTreeSet::new();
        };
        match serde_json::from_str::<BTreeMap<String, u8>>(encoded) {
            Ok(set) => set.into_keys().collect(),
            Err(e) => {
                warn!(service = %id, error = %e, "Unreadable upstream set");
                BTreeSet::new()
            }
        }
    }

    /// Add `upstream` to the set. Returns `false` if it was already there.
    pub fn add_upstream(&self, id: &ServiceId, upstream: &str) -> Result<bool, TableError> {
        let mut set = self.upstreams(id);
        if !set.insert(upstream.to_string()) {
            return Ok(false);
        }
        self.store(id, &set)?;
        debug!(service = %id, upstream = %upstream, upstreams = set.len(), "Upstream added");
        Ok(true)
    }

    /// Remove `upstream` from the set, deleting the row once it is empty.
    /// Returns `false` if it was not there.
    pub fn remove_upstream(&self, id: &ServiceId, upstream: &str) -> Result<bool, TableError> {
        let mut set = self.upstreams(id);
        if !set.remove(upstream) {
            return Ok(false);
        }
        if set.is_empty() {
            self.table.del(id.as_str())?;
        } else {
            self.store(id, &set)?;
        }
        debug!(service = %id, upstream = %upstream, upstreams = set.len(), "Upstream removed");
        Ok(true)
    }

    /// Every service with its upstreams.
    pub fn services(&self) -> BTreeMap<ServiceId, BTreeSet<String>> {
        self.table
            .keys()
            .into_iter()
            .map(ServiceId::new)
            .map(|id| {
                let upstreams = self.upstreams(&id);
                (id, upstreams)
            })
            .collect()
    }

    fn store(&self, id: &ServiceId, set: &BTreeSet<String>) -> Result<(), TableError> {
        let encoded: BTreeMap<&str, u8> = set.iter().map(|u| (u.as_str(), 1)).collect();
        let encoded = encode_json(UPSTREAM, &encoded)?;
        self.table.set(id.as_str(), [(UPSTREAM, Value::from(encoded))])
    }
}
