//! ACME v2 protocol client
//!
//! Implements the RFC 8555 flow against any directory-based CA:
//! account registration, orders, authorizations, HTTP-01 challenge
//! completion, finalization, certificate download and revocation.
//!
//! All waits are fixed-interval polls bounded by a deadline taken when the
//! operation starts. There is no backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::header::{LINK, LOCATION};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::OnceCell;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use super::certificate::{Certificate, CertificateRequest, CertificateResponse};
use super::error::AcmeError;
use super::jws::{AccountKey, KeyId};
use super::transport::{read_json, Transport};
use super::types::{
    AccountInfo, AccountResource, AuthorizationChallenge, AuthorizationResource, CertificateOrder,
    ChallengeState, ChallengeStatus, Directory, Identifier, OrderResource, OrderStatus,
    RevocationReason,
};

/// Default status poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound for challenge validation and finalization
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// External account binding credentials
#[derive(Debug, Clone)]
pub struct ExternalAccount {
    pub id: String,
    /// base64url HMAC key
    pub key: String,
}

/// ACME protocol client bound to one account key and one CA directory
pub struct AcmeClient {
    transport: Transport,
    directory_url: String,
    /// Fetched on first use, kept for the lifetime of the client
    directory: OnceCell<Directory>,
    /// Resolved on first authenticated request
    account_url: OnceCell<String>,
    poll_interval: Duration,
}

impl AcmeClient {
    pub fn new(http: Client, directory_url: impl Into<String>, key: AccountKey) -> Self {
        Self {
            transport: Transport::new(http, key),
            directory_url: directory_url.into(),
            directory: OnceCell::new(),
            account_url: OnceCell::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the status poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn account_key(&self) -> &AccountKey {
        self.transport.key()
    }

    /// The CA directory, fetched once.
    pub async fn directory(&self) -> Result<&Directory, AcmeError> {
        self.directory
            .get_or_try_init(|| async {
                debug!(url = %self.directory_url, "Fetching ACME directory");
                self.transport.get_json::<Directory>(&self.directory_url).await
            })
            .await
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// Create the account, or find the existing one for this key.
    pub async fn register_account(
        &self,
        email: Option<&str>,
        external_account: Option<&ExternalAccount>,
    ) -> Result<AccountInfo, AcmeError> {
        let directory = self.directory().await?;

        let mut payload = json!({ "termsOfServiceAgreed": true });
        if let Some(email) = email.filter(|e| !e.is_empty()) {
            payload["contact"] = json!([format!("mailto:{}", email)]);
        }
        if let Some(eab) = external_account {
            let binding = self.account_key().external_account_binding(
                &eab.id,
                &eab.key,
                &directory.new_account,
            )?;
            payload["externalAccountBinding"] = serde_json::to_value(binding)?;
        }

        let response = self
            .transport
            .post(
                &directory.new_nonce,
                &directory.new_account,
                KeyId::Jwk,
                Some(&payload),
            )
            .await?;
        let created = response.status() == reqwest::StatusCode::CREATED;
        let url = location(&response)?;
        // A concurrent lookup may already have resolved the same URL.
        let _ = self.account_url.set(url.clone());

        let account: AccountResource = self.post_as_get(&url).await?;
        info!(
            account = %url,
            created = created,
            status = %account.status,
            "ACME account ready"
        );

        Ok(AccountInfo {
            url,
            status: account.status,
            contact: account.contact,
            orders: account.orders,
        })
    }

    async fn account_url(&self) -> Result<&str, AcmeError> {
        self.account_url
            .get_or_try_init(|| async {
                let directory = self.directory().await?;
                debug!("Looking up ACME account for the current key");
                let response = self
                    .transport
                    .post(
                        &directory.new_nonce,
                        &directory.new_account,
                        KeyId::Jwk,
                        Some(&json!({ "onlyReturnExisting": true })),
                    )
                    .await?;
                location(&response)
            })
            .await
            .map(String::as_str)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Create an order with one DNS identifier per domain.
    pub async fn request_order(&self, domains: &[String]) -> Result<CertificateOrder, AcmeError> {
        validate_domains(domains)?;
        let directory = self.directory().await?;

        let identifiers: Vec<Identifier> = domains.iter().map(Identifier::dns).collect();
        let response = self
            .post_kid(&directory.new_order, Some(&json!({ "identifiers": identifiers })))
            .await?;
        let endpoint = location(&response)?;
        let order: OrderResource = read_json(response).await?;

        debug!(
            order = %endpoint,
            status = %order.status,
            domains = ?domains,
            "ACME order created"
        );
        self.build_order(endpoint, order).await
    }

    /// Re-fetch an order and rebuild its challenges.
    pub async fn reload_order(
        &self,
        order: &CertificateOrder,
    ) -> Result<CertificateOrder, AcmeError> {
        let resource: OrderResource = self.post_as_get(order.order_endpoint()).await?;
        self.build_order(order.order_endpoint().to_string(), resource)
            .await
    }

    async fn build_order(
        &self,
        endpoint: String,
        order: OrderResource,
    ) -> Result<CertificateOrder, AcmeError> {
        if order.authorizations.is_empty() {
            return Err(AcmeError::ChallengeNotSupported);
        }

        let mut challenges: BTreeMap<String, Vec<AuthorizationChallenge>> = BTreeMap::new();
        for authz_url in &order.authorizations {
            let authz: AuthorizationResource = self.post_as_get(authz_url).await?;
            let domain = if authz.wildcard {
                format!("*.{}", authz.identifier.value)
            } else {
                authz.identifier.value.clone()
            };

            let entry = challenges.entry(domain.clone()).or_default();
            for state in authz.challenges {
                entry.push(self.challenge_from_state(&domain, state));
            }
        }

        Ok(CertificateOrder::new(challenges, endpoint, order.status))
    }

    fn challenge_from_state(&self, domain: &str, state: ChallengeState) -> AuthorizationChallenge {
        AuthorizationChallenge {
            domain: domain.to_string(),
            status: state.status,
            payload: self.account_key().key_authorization(&state.token),
            kind: state.kind,
            url: state.url,
            token: state.token,
        }
    }

    /// Submit the CSR and wait for the certificate.
    ///
    /// A pending order at the deadline is not reported separately: the
    /// final status check fails unless the order is exactly `valid`.
    pub async fn finalize_order(
        &self,
        order: &CertificateOrder,
        csr: &CertificateRequest,
        timeout: Duration,
        want_alternate_chain: bool,
    ) -> Result<CertificateResponse, AcmeError> {
        let deadline = Instant::now() + timeout;
        let endpoint = order.order_endpoint();

        let mut resource: OrderResource = self.post_as_get(endpoint).await?;
        if resource.status.is_in_progress() {
            let finalize_url = resource.finalize.clone().ok_or_else(|| {
                AcmeError::MalformedResponse(format!("order {} has no finalize URL", endpoint))
            })?;
            let csr_der = URL_SAFE_NO_PAD.encode(csr.to_der()?);
            let response = self
                .post_kid(&finalize_url, Some(&json!({ "csr": csr_der })))
                .await?;
            resource = read_json(response).await?;
            debug!(order = %endpoint, status = %resource.status, "Order finalize submitted");

            while resource.status.is_in_progress() && Instant::now() < deadline {
                sleep(self.poll_interval).await;
                resource = self.post_as_get(endpoint).await?;
                trace!(order = %endpoint, status = %resource.status, "Polled order");
            }
        }

        if resource.status != OrderStatus::Valid {
            let detail = resource
                .error
                .map(|p| format!(": {}", p))
                .unwrap_or_default();
            return Err(AcmeError::CertificateRequestFailed(format!(
                "order {} ended in status {}{}",
                endpoint, resource.status, detail
            )));
        }

        let certificate_url = resource.certificate.ok_or_else(|| {
            AcmeError::CertificateRequestFailed(format!(
                "valid order {} has no certificate URL",
                endpoint
            ))
        })?;
        let certificate = self
            .download_certificate(&certificate_url, want_alternate_chain)
            .await?;

        info!(
            order = %endpoint,
            domain = %csr.common_name(),
            chain_length = certificate.chain().count(),
            "Certificate issued"
        );
        Ok(CertificateResponse {
            csr: csr.clone(),
            certificate,
        })
    }

    async fn download_certificate(
        &self,
        url: &str,
        want_alternate_chain: bool,
    ) -> Result<Certificate, AcmeError> {
        let response = self.post_kid(url, None).await?;
        let alternate = alternate_link(&response);
        let mut bundle = response.text().await?;

        if want_alternate_chain {
            if let Some(alternate) = alternate {
                debug!(url = %alternate, "Downloading alternate certificate chain");
                bundle = self.post_kid(&alternate, None).await?.text().await?;
            }
        }

        Certificate::from_pem_bundle(&bundle).ok_or_else(|| {
            AcmeError::CertificateRequestFailed(format!("{} returned no certificate", url))
        })
    }

    // =========================================================================
    // Authorizations
    // =========================================================================

    /// Challenges of a fresh single-domain order.
    pub async fn request_authorization(
        &self,
        domain: &str,
    ) -> Result<Vec<AuthorizationChallenge>, AcmeError> {
        let order = match self.request_order(&[domain.to_string()]).await {
            Ok(order) => order,
            Err(e @ AcmeError::Client { .. }) => {
                warn!(domain = %domain, error = %e, "CA refused authorization order");
                return Err(AcmeError::ChallengeNotSupported);
            }
            Err(e) => return Err(e),
        };

        order
            .authorization_challenges(domain)
            .map(<[AuthorizationChallenge]>::to_vec)
            .ok_or(AcmeError::ChallengeNotSupported)
    }

    /// Re-fetch the state of one challenge.
    pub async fn reload_authorization(
        &self,
        challenge: &AuthorizationChallenge,
    ) -> Result<AuthorizationChallenge, AcmeError> {
        let state: ChallengeState = self.post_as_get(&challenge.url).await?;
        Ok(self.challenge_from_state(&challenge.domain, state))
    }

    /// Ask the CA to validate a challenge and wait for its verdict.
    pub async fn challenge_authorization(
        &self,
        challenge: &AuthorizationChallenge,
        timeout: Duration,
    ) -> Result<ChallengeState, AcmeError> {
        let deadline = Instant::now() + timeout;

        let mut state: ChallengeState = if challenge.status == ChallengeStatus::Pending {
            debug!(domain = %challenge.domain, url = %challenge.url, "Triggering challenge validation");
            let response = self.post_kid(&challenge.url, Some(&json!({}))).await?;
            read_json(response).await?
        } else {
            self.post_as_get(&challenge.url).await?
        };

        while state.status.is_in_progress() && Instant::now() < deadline {
            sleep(self.poll_interval).await;
            state = self.post_as_get(&challenge.url).await?;
            trace!(domain = %challenge.domain, status = %state.status, "Polled challenge");
        }

        match state.status {
            ChallengeStatus::Valid => {
                debug!(domain = %challenge.domain, "Challenge validated");
                Ok(state)
            }
            status if status.is_in_progress() => Err(AcmeError::ChallengeTimedOut { status }),
            status => Err(AcmeError::ChallengeFailed {
                status,
                problem: state.error,
            }),
        }
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    /// Order for the CSR's names, then finalize.
    pub async fn request_certificate(
        &self,
        domain: &str,
        csr: &CertificateRequest,
        timeout: Duration,
        want_alternate_chain: bool,
    ) -> Result<CertificateResponse, AcmeError> {
        let mut domains = vec![domain.to_string()];
        for name in csr.subject_alternative_names() {
            if !domains.contains(name) {
                domains.push(name.clone());
            }
        }

        let order = self.request_order(&domains).await?;
        self.finalize_order(&order, csr, timeout, want_alternate_chain)
            .await
    }

    /// Revoke a certificate issued to this account.
    pub async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        reason: Option<RevocationReason>,
    ) -> Result<(), AcmeError> {
        let directory = self.directory().await?;
        let revoke_url = directory.revoke_cert.as_deref().ok_or_else(|| {
            AcmeError::CertificateRevocation("CA does not advertise revokeCert".to_string())
        })?;

        let der = certificate
            .to_der()
            .map_err(|e| AcmeError::CertificateRevocation(e.to_string()))?;
        let payload = json!({
            "certificate": URL_SAFE_NO_PAD.encode(der),
            "reason": reason.unwrap_or_default().code(),
        });

        self.post_kid(revoke_url, Some(&payload))
            .await
            .map_err(|e| AcmeError::CertificateRevocation(e.to_string()))?;
        info!(reason = reason.unwrap_or_default().code(), "Certificate revoked");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn post_kid(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Response, AcmeError> {
        let account_url = self.account_url().await?;
        let directory = self.directory().await?;
        self.transport
            .post(&directory.new_nonce, url, KeyId::Kid(account_url), payload)
            .await
    }

    async fn post_as_get<T: DeserializeOwned>(&self, url: &str) -> Result<T, AcmeError> {
        read_json(self.post_kid(url, None).await?).await
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("account_url", &self.account_url.get())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn validate_domains(domains: &[String]) -> Result<(), AcmeError> {
    if domains.is_empty() {
        return Err(AcmeError::InvalidArgument(
            "an order needs at least one domain".to_string(),
        ));
    }
    for (i, domain) in domains.iter().enumerate() {
        if domain.trim().is_empty() {
            return Err(AcmeError::InvalidArgument("blank domain in order".to_string()));
        }
        if domains[..i].contains(domain) {
            return Err(AcmeError::InvalidArgument(format!(
                "duplicate domain '{}' in order",
                domain
            )));
        }
    }
    Ok(())
}

fn location(response: &Response) -> Result<String, AcmeError> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            AcmeError::MalformedResponse(format!("{} returned no Location header", response.url()))
        })
}

/// First `Link: <url>;rel="alternate"` target.
fn alternate_link(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|link| {
            let (target, params) = link.trim().split_once(';')?;
            let is_alternate = params
                .split(';')
                .map(str::trim)
                .any(|p| p == "rel=\"alternate\"" || p == "rel=alternate");
            is_alternate.then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
        })
}
