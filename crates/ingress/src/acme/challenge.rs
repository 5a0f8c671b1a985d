//! HTTP-01 challenge responses
//!
//! Holds the key authorizations served under
//! `/.well-known/acme-challenge/<token>`. Responses are keyed by domain:
//! each domain has at most one published challenge, and a lookup must
//! name both the domain (the request's `Host`) and the token. Two domains
//! publishing the same token never see each other's response.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
struct Published {
    token: String,
    key_authorization: String,
}

/// Published HTTP-01 responses
///
/// Cloning shares the underlying map, so the registry that publishes and
/// the HTTP responder that serves see the same state.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    /// domain -> published challenge
    published: Arc<DashMap<String, Published>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the response for `domain`, replacing any earlier token.
    pub fn add_challenge(&self, domain: &str, token: &str, key_authorization: &str) {
        debug!(domain = %domain, token = %token, "Publishing ACME HTTP-01 challenge");
        self.published.insert(
            normalize_domain(domain),
            Published {
                token: token.to_string(),
                key_authorization: key_authorization.to_string(),
            },
        );
    }

    /// Withdraw whatever is published for `domain`.
    pub fn remove_domain(&self, domain: &str) -> bool {
        match self.published.remove(&normalize_domain(domain)) {
            Some((_, published)) => {
                debug!(domain = %domain, token = %published.token, "Removed ACME challenge");
                true
            }
            None => false,
        }
    }

    /// Key authorization published for `token` on `domain`.
    pub fn get_response(&self, domain: &str, token: &str) -> Option<String> {
        let result = self
            .published
            .get(&normalize_domain(domain))
            .filter(|published| published.token == token)
            .map(|published| published.key_authorization.clone());
        trace!(domain = %domain, token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token part of a challenge request path.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    pub fn pending_count(&self) -> usize {
        self.published.len()
    }

    /// Drop every published challenge.
    pub fn clear(&self) {
        let count = self.published.len();
        self.published.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

/// Host part of a `Host` header or authority, lowercased, without port or
/// trailing dot.
fn normalize_domain(host: &str) -> String {
    let host = host.trim();
    let name = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    name.trim_end_matches('.').to_ascii_lowercase()
}
