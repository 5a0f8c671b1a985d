//! Issuance error types

use thiserror::Error;

use crate::acme::AcmeError;
use crate::registry::RegistryError;
use crate::table::TableError;

/// Errors raised while issuing a certificate
///
/// Only [`IssuanceError::SanityCheckFailed`] escapes an issuance attempt;
/// everything else is logged and folded into
/// [`IssuanceOutcome::Failed`](super::IssuanceOutcome::Failed).
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("domain '{domain}' did not reach this controller after {attempts} attempts")]
    SanityCheckFailed { domain: String, attempts: u32 },

    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),

    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("signing error: {0}")]
    Signing(#[from] rcgen::Error),

    #[error("probe client error: {0}")]
    Probe(#[from] reqwest::Error),
}

impl IssuanceError {
    /// Whether this error must escape the per-attempt isolation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IssuanceError::SanityCheckFailed { .. })
    }
}
