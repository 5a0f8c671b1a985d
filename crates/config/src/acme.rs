//! ACME issuance settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Minimum renewal check interval (1 hour)
const MIN_RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// External account binding credentials (RFC 8555 §7.3.4)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccountConfig {
    /// Key identifier issued by the CA
    pub id: String,
    /// HMAC key, base64url encoded
    pub key: String,
}

/// ACME account and issuance settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AcmeConfig {
    /// Contact email registered with the CA
    #[validate(email)]
    pub email: String,

    /// CA directory URL
    #[validate(url)]
    pub directory_url: String,

    /// Optional external account binding
    pub external_account: Option<ExternalAccountConfig>,

    /// Sanity-check attempts before giving up on a domain
    #[validate(range(min = 1))]
    pub max_sanity_check_tries: u32,

    /// Seconds between sanity-check attempts
    pub sanity_check_interval_secs: u64,

    /// Upper bound on waiting for the CA to validate a challenge
    #[validate(range(min = 1))]
    pub challenge_timeout_secs: u64,

    /// Upper bound on waiting for an order to become valid after finalize
    #[validate(range(min = 1))]
    pub finalize_timeout_secs: u64,

    /// Fixed interval between CA status polls
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,

    /// Prefer the CA's alternate chain when one is advertised
    pub want_alternate_chain: bool,

    /// Renew certificates this many days before they expire
    #[validate(range(min = 1, max = 89))]
    pub renew_before_days: u32,

    /// Seconds between renewal sweeps
    pub renewal_check_interval_secs: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: "admin@localhost".to_string(),
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            external_account: None,
            max_sanity_check_tries: 5,
            sanity_check_interval_secs: 60,
            challenge_timeout_secs: 180,
            finalize_timeout_secs: 180,
            poll_interval_ms: 1000,
            want_alternate_chain: false,
            renew_before_days: 30,
            renewal_check_interval_secs: 12 * 3600,
        }
    }
}

impl AcmeConfig {
    pub fn sanity_check_interval(&self) -> Duration {
        Duration::from_secs(self.sanity_check_interval_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.challenge_timeout_secs)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Renewal sweep interval, clamped to at least one hour.
    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_interval_secs).max(MIN_RENEWAL_CHECK_INTERVAL)
    }

    /// Contact URIs for account registration.
    pub fn contacts(&self) -> Vec<String> {
        if self.email.is_empty() {
            Vec::new()
        } else {
            vec![format!("mailto:{}", self.email)]
        }
    }
}
