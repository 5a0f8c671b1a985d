//! ACME error types

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

use super::types::ChallengeStatus;

/// RFC 7807 problem document returned by the CA
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Problem {
    /// Problem type URN, e.g. `urn:ietf:params:acme:error:badNonce`
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Problem {
    /// Build a problem from a non-JSON error body.
    pub fn from_body(body: &str) -> Self {
        let body = body.trim();
        Self {
            kind: String::new(),
            detail: (!body.is_empty()).then(|| body.to_string()),
            status: None,
        }
    }

    /// The CA rejected the anti-replay nonce.
    pub fn is_bad_nonce(&self) -> bool {
        self.kind.ends_with(":badNonce")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.detail, self.kind.is_empty()) {
            (Some(detail), false) => write!(f, "{} ({})", detail, self.kind),
            (Some(detail), true) => f.write_str(detail),
            (None, false) => f.write_str(&self.kind),
            (None, true) => f.write_str("no problem details"),
        }
    }
}

/// Errors from the ACME protocol client
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("order carries no authorizations for a supported challenge")]
    ChallengeNotSupported,

    #[error("challenge still {status} when the deadline passed")]
    ChallengeTimedOut { status: ChallengeStatus },

    #[error("challenge ended with status {status}: {}", .problem.as_ref().map(ToString::to_string).unwrap_or_default())]
    ChallengeFailed {
        status: ChallengeStatus,
        problem: Option<Problem>,
    },

    #[error("certificate request failed: {0}")]
    CertificateRequestFailed(String),

    #[error("certificate revocation failed: {0}")]
    CertificateRevocation(String),

    #[error("CA rejected the request ({status}): {problem}")]
    Client { status: u16, problem: Problem },

    #[error("CA server error ({status}): {problem}")]
    Server { status: u16, problem: Problem },

    #[error("malformed CA response: {0}")]
    MalformedResponse(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("key or certificate error: {0}")]
    Crypto(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AcmeError {
    /// Classify a non-2xx CA answer.
    pub fn from_status(status: u16, problem: Problem) -> Self {
        if status >= 500 {
            AcmeError::Server { status, problem }
        } else {
            AcmeError::Client { status, problem }
        }
    }

    /// Whether this is a 4xx answer from the CA.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AcmeError::Client { .. })
    }
}

impl From<rcgen::Error> for AcmeError {
    fn from(e: rcgen::Error) -> Self {
        AcmeError::Crypto(e.to_string())
    }
}
