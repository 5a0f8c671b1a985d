//! ACME HTTP-01 certificate generator
//!
//! Drives [`AcmeClient`] against a registry that can publish HTTP-01
//! responses. Before any CA call, a throwaway challenge proves that the
//! domain actually reaches this controller; publishing the real challenge
//! is then checked locally before the CA is asked to validate it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use wharf_common::CertificateSource;
use wharf_config::AcmeConfig;

use super::{isolate, CertificateGenerator, IssuanceError, IssuanceOutcome, IssuanceStage};
use crate::acme::{
    AcmeClient, AuthorizationChallenge, CertificateRequest, CertificateResponse, OrderStatus,
    ACME_CHALLENGE_PREFIX,
};
use crate::registry::{Capabilities, HttpChallengeResponder, Reloadable};
use crate::table::CertificateTable;

/// Token of the reachability probe challenge
const SANITY_TOKEN: &str = "dummy";

/// Tuning for one generator
#[derive(Debug, Clone)]
pub struct IssuanceSettings {
    /// Reachability probes before giving up on a domain
    pub max_sanity_check_tries: u32,
    pub sanity_check_interval: Duration,
    /// Request timeout of every local probe
    pub probe_timeout: Duration,
    /// Port the domain is probed on
    pub probe_port: u16,
    pub local_validation_tries: u32,
    pub local_validation_interval: Duration,
    pub challenge_timeout: Duration,
    pub finalize_timeout: Duration,
    pub want_alternate_chain: bool,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self::from(&AcmeConfig::default())
    }
}

impl From<&AcmeConfig> for IssuanceSettings {
    fn from(config: &AcmeConfig) -> Self {
        Self {
            max_sanity_check_tries: config.max_sanity_check_tries,
            sanity_check_interval: config.sanity_check_interval(),
            probe_timeout: Duration::from_secs(5),
            probe_port: 80,
            local_validation_tries: 3,
            local_validation_interval: config.poll_interval(),
            challenge_timeout: config.challenge_timeout(),
            finalize_timeout: config.finalize_timeout(),
            want_alternate_chain: config.want_alternate_chain,
        }
    }
}

/// Issues certificates through ACME HTTP-01
pub struct AcmeGenerator {
    client: Arc<AcmeClient>,
    certificates: Arc<CertificateTable>,
    http_challenge: Option<Arc<dyn HttpChallengeResponder>>,
    reloader: Option<Arc<dyn Reloadable>>,
    /// Certificate key pair, PEM
    key_pem: String,
    probe: reqwest::Client,
    settings: IssuanceSettings,
}

impl AcmeGenerator {
    pub fn new(
        client: Arc<AcmeClient>,
        certificates: Arc<CertificateTable>,
        capabilities: &Capabilities,
        key_pem: impl Into<String>,
        settings: IssuanceSettings,
    ) -> Result<Self, IssuanceError> {
        let probe = reqwest::Client::builder()
            .timeout(settings.probe_timeout)
            .build()?;

        if capabilities.http_challenge.is_none() {
            warn!("Registry cannot serve HTTP-01 challenges, ACME issuance disabled");
        }

        Ok(Self {
            client,
            certificates,
            http_challenge: capabilities.http_challenge.clone(),
            reloader: capabilities.reloader.clone(),
            key_pem: key_pem.into(),
            probe,
            settings,
        })
    }

    /// Replace the HTTP client used for local probes.
    pub fn with_probe_client(mut self, probe: reqwest::Client) -> Self {
        self.probe = probe;
        self
    }

    pub fn settings(&self) -> &IssuanceSettings {
        &self.settings
    }

    async fn attempt(
        &self,
        http: &dyn HttpChallengeResponder,
        domain: &str,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        stage(domain, IssuanceStage::Start);
        self.sanity_check(http, domain).await?;

        if self.certificates.exist(domain) {
            stage(domain, IssuanceStage::AlreadyIssued);
            return Ok(IssuanceOutcome::AlreadyIssued);
        }

        let order = self.client.request_order(&[domain.to_string()]).await?;
        stage(domain, IssuanceStage::OrderRequested);
        if order.status() != OrderStatus::Pending {
            info!(
                domain = %domain,
                status = %order.status(),
                "Order is not pending, leaving it to its owner"
            );
            return Ok(IssuanceOutcome::OrderNotPending(order.status()));
        }

        let Some(challenge) = order.http_challenge(domain).cloned() else {
            warn!(domain = %domain, "Order offers no HTTP-01 challenge");
            return Ok(IssuanceOutcome::NoHttpChallenge);
        };
        stage(domain, IssuanceStage::ChallengeSelected);

        self.publish(http, domain, &challenge.token, &challenge.payload)
            .await?;
        stage(domain, IssuanceStage::ChallengePublished);

        // The challenge is withdrawn whatever the verdict.
        let validated = self.validate(domain, &challenge).await;
        let withdrawn = self.withdraw(http, domain).await;
        if !validated? {
            return Ok(IssuanceOutcome::LocalValidationFailed);
        }
        withdrawn?;
        stage(domain, IssuanceStage::CleanedUp);

        let order = self.client.reload_order(&order).await?;
        let csr = CertificateRequest::new(domain, self.key_pem.as_str());
        let response = self
            .client
            .finalize_order(
                &order,
                &csr,
                self.settings.finalize_timeout,
                self.settings.want_alternate_chain,
            )
            .await?;
        stage(domain, IssuanceStage::Finalized);

        let expires_at = self.save(domain, &response)?;
        stage(domain, IssuanceStage::Saved);
        Ok(IssuanceOutcome::Issued { expires_at })
    }

    // =========================================================================
    // Reachability and local validation
    // =========================================================================

    async fn sanity_check(
        &self,
        http: &dyn HttpChallengeResponder,
        domain: &str,
    ) -> Result<(), IssuanceError> {
        stage(domain, IssuanceStage::SanityCheck);
        self.publish(http, domain, SANITY_TOKEN, SANITY_TOKEN).await?;

        let url = self.challenge_url(domain, SANITY_TOKEN);
        let tries = self.settings.max_sanity_check_tries.max(1);
        let mut reachable = false;
        for attempt in 1..=tries {
            if self.probe(&url).await.is_some() {
                debug!(domain = %domain, attempt = attempt, "Domain reaches this controller");
                reachable = true;
                break;
            }
            if attempt < tries {
                warn!(
                    domain = %domain,
                    attempt = attempt,
                    max_attempts = tries,
                    "Domain not reachable yet, retrying"
                );
                sleep(self.settings.sanity_check_interval).await;
            }
        }

        self.withdraw(http, domain).await?;
        if reachable {
            Ok(())
        } else {
            Err(IssuanceError::SanityCheckFailed {
                domain: domain.to_string(),
                attempts: tries,
            })
        }
    }

    /// Fetch the published challenge and compare it to the key
    /// authorization. `Ok(false)` when it never matched.
    async fn validate(
        &self,
        domain: &str,
        challenge: &AuthorizationChallenge,
    ) -> Result<bool, IssuanceError> {
        let url = self.challenge_url(domain, &challenge.token);
        let tries = self.settings.local_validation_tries.max(1);
        let mut served = false;
        for attempt in 1..=tries {
            match self.probe(&url).await {
                Some(body) if body.trim() == challenge.payload => {
                    served = true;
                    break;
                }
                Some(_) => debug!(domain = %domain, attempt = attempt, "Challenge body mismatch"),
                None => debug!(domain = %domain, attempt = attempt, "Challenge not served yet"),
            }
            if attempt < tries {
                sleep(self.settings.local_validation_interval).await;
            }
        }
        if !served {
            warn!(
                domain = %domain,
                url = %url,
                "Published challenge is not servable, not asking the CA"
            );
            return Ok(false);
        }
        stage(domain, IssuanceStage::LocallyValidated);

        self.client
            .challenge_authorization(challenge, self.settings.challenge_timeout)
            .await?;
        stage(domain, IssuanceStage::CaValidated);
        Ok(true)
    }

    /// Body of a 200 answer, `None` otherwise.
    async fn probe(&self, url: &str) -> Option<String> {
        match self.probe.get(url).send().await {
            Ok(response) if response.status() == StatusCode::OK => response.text().await.ok(),
            Ok(response) => {
                debug!(url = %url, status = response.status().as_u16(), "Probe answered");
                None
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Probe failed");
                None
            }
        }
    }

    fn challenge_url(&self, domain: &str, token: &str) -> String {
        if self.settings.probe_port == 80 {
            format!("http://{}{}{}", domain, ACME_CHALLENGE_PREFIX, token)
        } else {
            format!(
                "http://{}:{}{}{}",
                domain, self.settings.probe_port, ACME_CHALLENGE_PREFIX, token
            )
        }
    }

    // =========================================================================
    // Registry
    // =========================================================================

    async fn publish(
        &self,
        http: &dyn HttpChallengeResponder,
        domain: &str,
        token: &str,
        payload: &str,
    ) -> Result<(), IssuanceError> {
        http.serve_http_challenge(domain, token, payload).await?;
        self.reload().await
    }

    async fn withdraw(
        &self,
        http: &dyn HttpChallengeResponder,
        domain: &str,
    ) -> Result<(), IssuanceError> {
        http.cleanup(domain).await?;
        self.reload().await
    }

    async fn reload(&self) -> Result<(), IssuanceError> {
        if let Some(reloader) = &self.reloader {
            reloader.reload().await?;
        }
        Ok(())
    }

    async fn reissue(&self, domain: &str) -> Result<IssuanceOutcome, IssuanceError> {
        let csr = CertificateRequest::new(domain, self.key_pem.as_str());
        let response = self
            .client
            .request_certificate(
                domain,
                &csr,
                self.settings.finalize_timeout,
                self.settings.want_alternate_chain,
            )
            .await?;
        let expires_at = self.save(domain, &response)?;
        info!(domain = %domain, expires = %expires_at, "Certificate renewed");
        Ok(IssuanceOutcome::Issued { expires_at })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Store the key and full chain, overwriting any earlier row.
    fn save(
        &self,
        domain: &str,
        response: &CertificateResponse,
    ) -> Result<DateTime<Utc>, IssuanceError> {
        let certificate = &response.certificate;
        let expires_at = certificate
            .not_after()
            .map_err(|e| IssuanceError::Certificate(e.to_string()))?;

        self.certificates.set_certificate(
            domain,
            response.csr.key_pem(),
            &certificate.full_chain_pem(),
            expires_at,
            CertificateSource::Acme,
        )?;
        Ok(expires_at)
    }
}

fn stage(domain: &str, stage: IssuanceStage) {
    debug!(domain = %domain, stage = %stage, "Issuance progress");
}

#[async_trait]
impl CertificateGenerator for AcmeGenerator {
    async fn create_new_certificate(
        &self,
        domain: &str,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        let Some(http) = &self.http_challenge else {
            warn!(domain = %domain, "Registry cannot serve HTTP-01 challenges, skipping issuance");
            return Ok(IssuanceOutcome::Unsupported);
        };

        let result = self.attempt(http.as_ref(), domain).await;
        if let Ok(IssuanceOutcome::Issued { expires_at }) = &result {
            info!(domain = %domain, expires = %expires_at, "Certificate issued");
        }
        isolate(domain, result)
    }

    /// Relies on the CA still holding a valid authorization for the domain.
    async fn renew(&self, domain: &str) -> Result<IssuanceOutcome, IssuanceError> {
        if self.http_challenge.is_none() {
            warn!(domain = %domain, "Registry cannot serve HTTP-01 challenges, skipping renewal");
            return Ok(IssuanceOutcome::Unsupported);
        }

        let result = self.reissue(domain).await;
        isolate(domain, result)
    }
}

impl std::fmt::Debug for AcmeGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeGenerator")
            .field("directory_url", &self.client.directory_url())
            .field("http_challenge", &self.http_challenge.is_some())
            .field("reloader", &self.reloader.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}
