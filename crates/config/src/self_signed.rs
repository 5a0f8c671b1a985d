//! Self-signed certificate settings.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Signing CA and validity of locally minted certificates
///
/// Without a CA each certificate signs itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SelfSignedConfig {
    /// CA certificate, PEM
    pub ca: Option<String>,

    /// CA private key, PEM
    pub ca_private_key: Option<String>,

    /// Lifetime of a minted certificate
    #[validate(range(min = 1, max = 3650))]
    pub validity_days: u32,
}

impl Default for SelfSignedConfig {
    fn default() -> Self {
        Self {
            ca: None,
            ca_private_key: None,
            validity_days: 365,
        }
    }
}

impl SelfSignedConfig {
    /// CA certificate and key, when both are set.
    pub fn signing_ca(&self) -> Option<(&str, &str)> {
        match (&self.ca, &self.ca_private_key) {
            (Some(ca), Some(key)) => Some((ca.as_str(), key.as_str())),
            _ => None,
        }
    }
}
