//! Configuration for the Wharf ingress controller.
//!
//! Configuration is layered: embedded defaults, then an optional TOML
//! file, then `ACME_*` and `SELF_SIGNED_*` environment overrides, then
//! validation.
//!
//! ```toml
//! [acme]
//! email = "ops@example.com"
//! directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
//! max_sanity_check_tries = 5
//! sanity_check_interval_secs = 60
//!
//! [self_signed]
//! validity_days = 90
//!
//! [tables]
//! certificate_rows = 1024
//!
//! [storage]
//! path = "/var/lib/wharf"
//!
//! [responder]
//! listen = "0.0.0.0:80"
//! ```

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use validator::{Validate, ValidationError};

pub mod acme;
pub mod env;
pub mod self_signed;

pub use acme::{AcmeConfig, ExternalAccountConfig, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
pub use self_signed::SelfSignedConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid environment override: {0}")]
    Env(#[from] envy::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Row and column capacities of the shared tables
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TableConfig {
    #[validate(range(min = 1))]
    pub certificate_rows: usize,
    /// Byte capacity of the key and full-chain PEM columns
    #[validate(range(min = 1024))]
    pub certificate_pem_size: usize,
    #[validate(range(min = 1))]
    pub service_rows: usize,
    /// Byte capacity of the encoded upstream set
    #[validate(range(min = 64))]
    pub upstream_size: usize,
    #[validate(range(min = 1))]
    pub config_rows: usize,
    #[validate(range(min = 1024))]
    pub config_value_size: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            certificate_rows: 1024,
            certificate_pem_size: 512_000,
            service_rows: 1024,
            upstream_size: 512_000,
            config_rows: 64,
            config_value_size: 16_384,
        }
    }
}

/// Durable storage behind the tables
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
        }
    }
}

/// Built-in HTTP-01 responder
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResponderConfig {
    pub enabled: bool,
    #[validate(custom(function = "validate_listen"))]
    pub listen: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:80".to_string(),
        }
    }
}

impl ResponderConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{}'", self.listen)))
    }
}

fn validate_listen(listen: &str) -> Result<(), ValidationError> {
    listen
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("socket_addr"))
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub acme: AcmeConfig,
    #[validate(nested)]
    pub self_signed: SelfSignedConfig,
    #[validate(nested)]
    pub tables: TableConfig,
    #[validate(nested)]
    pub storage: StorageConfig,
    #[validate(nested)]
    pub responder: ResponderConfig,
}

impl Config {
    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Parsing configuration file");
        Self::from_toml_str(&content)
    }

    /// Load the layered configuration: defaults, optional file,
    /// `ACME_*` and `SELF_SIGNED_*` environment, validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Self::from_file(path)?
            }
            None => {
                info!("No configuration file given, using defaults");
                Self::default()
            }
        };
        env::apply_acme_env(&mut config.acme)?;
        env::apply_self_signed_env(&mut config.self_signed)?;
        config.check()?;
        Ok(config)
    }

    /// Derive-based validation plus cross-field checks.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(eab) = &self.acme.external_account {
            if eab.id.trim().is_empty() || eab.key.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "external account binding requires both id and key".to_string(),
                ));
            }
        }
        let self_signed = &self.self_signed;
        if self_signed.ca.is_some() != self_signed.ca_private_key.is_some() {
            return Err(ConfigError::Invalid(
                "self-signed CA requires both the certificate and its private key".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.check().unwrap();
        assert!(config.responder.enabled);
        assert_eq!(config.tables.certificate_pem_size, 512_000);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [acme]
            email = "ops@example.com"
            directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"

            [storage]
            path = "/var/lib/wharf"
            "#,
        )
        .unwrap();

        assert_eq!(config.acme.email, "ops@example.com");
        assert_eq!(config.acme.directory_url, LETS_ENCRYPT_STAGING);
        assert_eq!(config.acme.max_sanity_check_tries, 5);
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/wharf"));
        assert_eq!(config.tables.service_rows, 1024);
        config.check().unwrap();
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[responder]\nlisten = \"127.0.0.1:8080\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.responder.listen_addr().unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/wharf.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_invalid_listen_rejected() {
        let config = Config {
            responder: ResponderConfig {
                enabled: true,
                listen: "port eighty".to_string(),
            },
            ..Default::default()
        };
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_self_signed_section() {
        let config = Config::from_toml_str(
            r#"
            [self_signed]
            ca = "ca-pem"
            ca_private_key = "key-pem"
            validity_days = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.self_signed.signing_ca(), Some(("ca-pem", "key-pem")));
        assert_eq!(config.self_signed.validity_days, 90);
        config.check().unwrap();

        assert_eq!(Config::default().self_signed.signing_ca(), None);
        assert_eq!(Config::default().self_signed.validity_days, 365);
    }

    #[test]
    fn test_self_signed_ca_needs_both_halves() {
        let mut config = Config::default();
        config.self_signed.ca = Some("ca-pem".to_string());
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));

        config.self_signed.validity_days = 0;
        config.self_signed.ca = None;
        assert!(matches!(config.check(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_blank_external_account_rejected() {
        let mut config = Config::default();
        config.acme.external_account = Some(ExternalAccountConfig {
            id: "kid".to_string(),
            key: " ".to_string(),
        });
        assert!(matches!(config.check(), Err(ConfigError::Invalid(_))));
    }
}
