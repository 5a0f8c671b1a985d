//! Certificate table: domain -> key, chain, expiry, source

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wharf_common::{AutoTls, CertificateSource};
use wharf_config::TableConfig;

use super::{Column, Table, TableError, TableStorage, Value};

pub const TABLE_NAME: &str = "ssl_certificate";

const PRIVATE_KEY: &str = "private_key";
const CERTIFICATE: &str = "certificate";
const EXPIRED_AT: &str = "expired_at";
const AUTO: &str = "auto";

/// A stored certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub private_key: String,
    /// Leaf followed by its issuers, PEM
    pub certificate: String,
    pub expires_at: DateTime<Utc>,
    pub source: CertificateSource,
}

impl CertificateRecord {
    /// Expires at or before `now + window`.
    pub fn expires_within(&self, window: chrono::Duration) -> bool {
        self.expires_at <= Utc::now() + window
    }
}

/// Certificates by domain
#[derive(Debug)]
pub struct CertificateTable {
    table: Table,
}

impl CertificateTable {
    pub fn open(config: &TableConfig, storage: Arc<dyn TableStorage>) -> Result<Self, TableError> {
        let table = Table::open(
            TABLE_NAME,
            vec![
                Column::string(PRIVATE_KEY, config.certificate_pem_size),
                Column::string(CERTIFICATE, config.certificate_pem_size),
                Column::string(EXPIRED_AT, 128),
                Column::int(AUTO),
            ],
            config.certificate_rows,
            storage,
        )?;
        Ok(Self { table })
    }

    pub fn exist(&self, domain: &str) -> bool {
        self.table.exist(domain)
    }

    /// Create or overwrite the row for `domain`.
    pub fn set_certificate(
        &self,
        domain: &str,
        private_key: &str,
        certificate: &str,
        expires_at: DateTime<Utc>,
        source: CertificateSource,
    ) -> Result<(), TableError> {
        self.table.set(
            domain,
            [
                (PRIVATE_KEY, Value::from(private_key)),
                (CERTIFICATE, Value::from(certificate)),
                (EXPIRED_AT, Value::from(expires_at.to_rfc3339())),
                (AUTO, Value::from(source.as_flag())),
            ],
        )?;
        info!(
            domain = %domain,
            expires = %expires_at,
            source = ?source,
            "Stored certificate"
        );
        Ok(())
    }

    /// The stored certificate, `None` if missing or unreadable.
    pub fn certificate(&self, domain: &str) -> Option<CertificateRecord> {
        let row = self.table.get_row(domain)?;
        let text = |column: &str| {
            row.get(column)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let expires_at = match text(EXPIRED_AT).map(|s| DateTime::parse_from_rfc3339(&s)) {
            Some(Ok(t)) => t.with_timezone(&Utc),
            Some(Err(e)) => {
                warn!(domain = %domain, error = %e, "Stored certificate has an unreadable expiry");
                return None;
            }
            None => {
                warn!(domain = %domain, "Stored certificate has no expiry");
                return None;
            }
        };

        Some(CertificateRecord {
            private_key: text(PRIVATE_KEY).unwrap_or_default(),
            certificate: text(CERTIFICATE).unwrap_or_default(),
            expires_at,
            source: CertificateSource::from_flag(
                row.get(AUTO).and_then(Value::as_int).unwrap_or(0),
            ),
        })
    }

    /// Every stored domain with its source.
    pub fn list_domains(&self) -> BTreeMap<String, CertificateSource> {
        self.table
            .rows()
            .into_iter()
            .map(|(domain, row)| {
                let flag = row.get(AUTO).and_then(Value::as_int).unwrap_or(0);
                (domain, CertificateSource::from_flag(flag))
            })
            .collect()
    }

    /// Automatically issued domains expiring within `window`, with the
    /// policy that renews each.
    pub fn expiring_within(&self, window: chrono::Duration) -> Vec<(String, AutoTls)> {
        let due: Vec<(String, AutoTls)> = self
            .list_domains()
            .into_iter()
            .filter_map(|(domain, source)| {
                let policy = source.policy()?;
                let record = self.certificate(&domain)?;
                record.expires_within(window).then_some((domain, policy))
            })
            .collect();
        debug!(due = due.len(), "Checked certificate expiry");
        due
    }

    pub fn delete(&self, domain: &str) -> Result<bool, TableError> {
        self.table.del(domain)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{FileTableStorage, MemoryTableStorage};
    use tempfile::TempDir;

    fn table() -> CertificateTable {
        CertificateTable::open(&TableConfig::default(), Arc::new(MemoryTableStorage::new()))
            .unwrap()
    }

    #[test]
    fn test_set_and_read_back() {
        let table = table();
        let expires = DateTime::parse_from_rfc3339("2031-06-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        table
            .set_certificate("app.example.com", "key", "chain", expires, CertificateSource::Acme)
            .unwrap();

        let record = table.certificate("app.example.com").unwrap();
        assert_eq!(record.private_key, "key");
        assert_eq!(record.certificate, "chain");
        assert_eq!(record.expires_at, expires);
        assert_eq!(record.source, CertificateSource::Acme);
        assert!(table.exist("app.example.com"));
    }

    #[test]
    fn test_overwrite() {
        let table = table();
        let now = Utc::now();
        table
            .set_certificate("app.example.com", "k1", "c1", now, CertificateSource::Manual)
            .unwrap();
        table
            .set_certificate("app.example.com", "k2", "c2", now, CertificateSource::Acme)
            .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.certificate("app.example.com").unwrap().certificate, "c2");
    }

    #[test]
    fn test_pem_capacity_enforced() {
        let config = TableConfig {
            certificate_pem_size: 1024,
            ..Default::default()
        };
        let table = CertificateTable::open(&config, Arc::new(MemoryTableStorage::new())).unwrap();
        let huge = "x".repeat(2048);
        let result = table.set_certificate(
            "app.example.com",
            "key",
            &huge,
            Utc::now(),
            CertificateSource::Acme,
        );
        assert!(matches!(result, Err(TableError::ValueTooLarge { .. })));
        assert!(!table.exist("app.example.com"));
    }

    #[test]
    fn test_expiring_within_skips_manual_and_fresh() {
        let table = table();
        let soon = Utc::now() + chrono::Duration::days(10);
        let later = Utc::now() + chrono::Duration::days(80);
        table
            .set_certificate("soon.example.com", "k", "c", soon, CertificateSource::Acme)
            .unwrap();
        table
            .set_certificate("later.example.com", "k", "c", later, CertificateSource::Acme)
            .unwrap();
        table
            .set_certificate("manual.example.com", "k", "c", soon, CertificateSource::Manual)
            .unwrap();
        table
            .set_certificate("lab.example.com", "k", "c", soon, CertificateSource::SelfSigned)
            .unwrap();

        assert_eq!(
            table.expiring_within(chrono::Duration::days(30)),
            vec![
                ("lab.example.com".to_string(), AutoTls::SelfSigned),
                ("soon.example.com".to_string(), AutoTls::Acme),
            ]
        );
        assert_eq!(table.list_domains().len(), 4);
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let expires = Utc::now();
        {
            let storage = Arc::new(FileTableStorage::new(temp_dir.path()).unwrap());
            let table = CertificateTable::open(&TableConfig::default(), storage).unwrap();
            table
                .set_certificate("app.example.com", "k", "c", expires, CertificateSource::Acme)
                .unwrap();
        }

        let storage = Arc::new(FileTableStorage::new(temp_dir.path()).unwrap());
        let table = CertificateTable::open(&TableConfig::default(), storage).unwrap();
        let record = table.certificate("app.example.com").unwrap();
        assert_eq!(record.expires_at.timestamp(), expires.timestamp());
    }

    #[test]
    fn test_delete() {
        let table = table();
        table
            .set_certificate("app.example.com", "k", "c", Utc::now(), CertificateSource::Acme)
            .unwrap();
        assert!(table.delete("app.example.com").unwrap());
        assert!(table.certificate("app.example.com").is_none());
    }
}
