//! ACME resources and the client-side views built from them

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::Problem;

/// HTTP-01 challenge type
pub const HTTP_01: &str = "http-01";

// =============================================================================
// Statuses
// =============================================================================

/// Order status (RFC 8555 §7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    /// The CA may still move this order forward.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Challenge status (RFC 8555 §7.1.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    /// Anything this client does not know about
    #[serde(other)]
    Unknown,
}

impl ChallengeStatus {
    /// The CA has not reached a verdict yet.
    pub fn is_in_progress(self) -> bool {
        matches!(self, ChallengeStatus::Pending | ChallengeStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Processing => "processing",
            ChallengeStatus::Valid => "valid",
            ChallengeStatus::Invalid => "invalid",
            ChallengeStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Wire resources
// =============================================================================

/// CA directory document (RFC 8555 §7.1.1)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub external_account_required: bool,
}

/// Order, authorization or CSR identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OrderResource {
    pub status: OrderStatus,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: Option<String>,
    pub certificate: Option<String>,
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthorizationResource {
    pub identifier: Identifier,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(default)]
    pub challenges: Vec<ChallengeState>,
}

/// Challenge resource as reported by the CA
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChallengeState {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub validated: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AccountResource {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub orders: Option<String>,
}

// =============================================================================
// Client views
// =============================================================================

/// A registered account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    /// Account URL, used as `kid` in signed requests
    pub url: String,
    pub status: String,
    pub contact: Vec<String>,
    pub orders: Option<String>,
}

/// One proof-of-control challenge with its expected response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationChallenge {
    pub domain: String,
    pub status: ChallengeStatus,
    pub kind: String,
    pub url: String,
    pub token: String,
    /// Key authorization: `token.thumbprint`
    pub payload: String,
}

impl AuthorizationChallenge {
    pub fn is_http01(&self) -> bool {
        self.kind == HTTP_01
    }
}

/// An in-flight order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOrder {
    challenges: BTreeMap<String, Vec<AuthorizationChallenge>>,
    order_endpoint: String,
    status: OrderStatus,
}

impl CertificateOrder {
    pub fn new(
        challenges: BTreeMap<String, Vec<AuthorizationChallenge>>,
        order_endpoint: impl Into<String>,
        status: OrderStatus,
    ) -> Self {
        Self {
            challenges,
            order_endpoint: order_endpoint.into(),
            status,
        }
    }

    /// Challenges per domain; wildcard domains are keyed `*.domain`.
    pub fn challenges(&self) -> &BTreeMap<String, Vec<AuthorizationChallenge>> {
        &self.challenges
    }

    /// Challenges of one domain, `None` if the order does not cover it.
    pub fn authorization_challenges(&self, domain: &str) -> Option<&[AuthorizationChallenge]> {
        self.challenges.get(domain).map(Vec::as_slice)
    }

    /// First HTTP-01 challenge for a domain.
    pub fn http_challenge(&self, domain: &str) -> Option<&AuthorizationChallenge> {
        self.authorization_challenges(domain)?
            .iter()
            .find(|c| c.is_http01())
    }

    pub fn order_endpoint(&self) -> &str {
        &self.order_endpoint
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }
}

/// Revocation reason codes (RFC 5280 §5.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
        }
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(RevocationReason::Unspecified),
            "key-compromise" | "keyCompromise" => Ok(RevocationReason::KeyCompromise),
            "affiliation-changed" | "affiliationChanged" => {
                Ok(RevocationReason::AffiliationChanged)
            }
            "superseded" => Ok(RevocationReason::Superseded),
            "cessation-of-operation" | "cessationOfOperation" => {
                Ok(RevocationReason::CessationOfOperation)
            }
            other => Err(format!("unknown revocation reason '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_resource_parsing() {
        let order: OrderResource = serde_json::from_str(
            r#"{
                "status": "pending",
                "expires": "2026-01-01T00:00:00Z",
                "identifiers": [{"type": "dns", "value": "app.example.com"}],
                "authorizations": ["https://ca/authz/1"],
                "finalize": "https://ca/order/1/finalize"
            }"#,
        )
        .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.authorizations.len(), 1);
        assert!(order.certificate.is_none());
    }

    #[test]
    fn test_unknown_challenge_status() {
        let state: ChallengeState = serde_json::from_str(
            r#"{"type":"tls-alpn-01","url":"https://ca/chal/2","status":"deactivated","token":"t"}"#,
        )
        .unwrap();
        assert_eq!(state.status, ChallengeStatus::Unknown);
        assert!(!state.status.is_in_progress());
    }

    #[test]
    fn test_http_challenge_selection() {
        let challenge = |kind: &str| AuthorizationChallenge {
            domain: "app.example.com".to_string(),
            status: ChallengeStatus::Pending,
            kind: kind.to_string(),
            url: format!("https://ca/chal/{}", kind),
            token: "tok".to_string(),
            payload: "tok.thumb".to_string(),
        };
        let mut map = BTreeMap::new();
        map.insert(
            "app.example.com".to_string(),
            vec![challenge("dns-01"), challenge("http-01")],
        );
        let order = CertificateOrder::new(map, "https://ca/order/1", OrderStatus::Pending);

        assert_eq!(
            order.http_challenge("app.example.com").map(|c| c.url.as_str()),
            Some("https://ca/chal/http-01")
        );
        assert!(order.http_challenge("other.example.com").is_none());
    }

    #[test]
    fn test_revocation_reason_codes() {
        assert_eq!(RevocationReason::default().code(), 0);
        assert_eq!("superseded".parse::<RevocationReason>().unwrap().code(), 4);
        assert!("bored".parse::<RevocationReason>().is_err());
    }
}
