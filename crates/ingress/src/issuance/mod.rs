//! Certificate issuance
//!
//! [`CertificateManager`] routes a service's [`AutoTls`] policy to a
//! [`CertificateGenerator`] and runs each attempt on its own task, so the
//! event pipeline never waits on a CA. [`AcmeGenerator`] is the HTTP-01
//! implementation and [`SelfSignedGenerator`] mints certificates locally;
//! [`RenewalScheduler`] re-issues certificates nearing expiry.
//!
//! Every attempt is isolated: failures are logged and reported as an
//! [`IssuanceOutcome`], except for an unreachable domain which surfaces
//! as [`IssuanceError::SanityCheckFailed`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wharf_common::AutoTls;

use crate::acme::OrderStatus;

mod acme;
mod error;
mod scheduler;
mod self_signed;

pub use acme::{AcmeGenerator, IssuanceSettings};
pub use error::IssuanceError;
pub use scheduler::{RenewalScheduler, SweepReport};
pub use self_signed::SelfSignedGenerator;

/// How an issuance attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuanceOutcome {
    /// A new certificate was stored
    Issued { expires_at: DateTime<Utc> },
    /// A certificate row already existed
    AlreadyIssued,
    /// The fresh order was not pending; someone else is handling it
    OrderNotPending(OrderStatus),
    /// The order offered no HTTP-01 challenge
    NoHttpChallenge,
    /// The published challenge could not be fetched back locally
    LocalValidationFailed,
    /// Nothing can issue for this policy or registry
    Unsupported,
    /// Another attempt for the domain is running in this process
    InFlight,
    /// The attempt failed; the error was logged
    Failed(String),
}

impl IssuanceOutcome {
    pub fn is_issued(&self) -> bool {
        matches!(self, IssuanceOutcome::Issued { .. })
    }
}

/// Progress of one issuance attempt, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceStage {
    Start,
    SanityCheck,
    AlreadyIssued,
    OrderRequested,
    ChallengeSelected,
    ChallengePublished,
    LocallyValidated,
    CaValidated,
    CleanedUp,
    Finalized,
    Saved,
}

impl IssuanceStage {
    pub fn as_str(self) -> &'static str {
        match self {
            IssuanceStage::Start => "start",
            IssuanceStage::SanityCheck => "sanity_check",
            IssuanceStage::AlreadyIssued => "already_issued",
            IssuanceStage::OrderRequested => "order_requested",
            IssuanceStage::ChallengeSelected => "challenge_selected",
            IssuanceStage::ChallengePublished => "challenge_published",
            IssuanceStage::LocallyValidated => "locally_validated",
            IssuanceStage::CaValidated => "ca_validated",
            IssuanceStage::CleanedUp => "cleaned_up",
            IssuanceStage::Finalized => "finalized",
            IssuanceStage::Saved => "saved",
        }
    }
}

impl fmt::Display for IssuanceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Obtains certificates for domains
#[async_trait]
pub trait CertificateGenerator: Send + Sync {
    /// Issue a certificate unless one is already stored.
    async fn create_new_certificate(&self, domain: &str)
        -> Result<IssuanceOutcome, IssuanceError>;

    /// Issue a fresh certificate, replacing the stored one.
    async fn renew(&self, domain: &str) -> Result<IssuanceOutcome, IssuanceError>;
}

/// Log and absorb everything but fatal errors.
fn isolate(
    domain: &str,
    result: Result<IssuanceOutcome, IssuanceError>,
) -> Result<IssuanceOutcome, IssuanceError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            error!(domain = %domain, error = %e, "Certificate issuance failed");
            Ok(IssuanceOutcome::Failed(e.to_string()))
        }
    }
}

/// Fire-and-forget certificate requests from the registry manager
pub trait CertificateRequester: Send + Sync {
    fn request_certificate(&self, policy: AutoTls, domain: &str);
}

// =============================================================================
// Certificate manager
// =============================================================================

/// Routes policies to generators and keeps one attempt per domain in flight
#[derive(Clone, Default)]
pub struct CertificateManager {
    generators: Arc<HashMap<AutoTls, Arc<dyn CertificateGenerator>>>,
    in_flight: Arc<DashMap<String, ()>>,
}

/// Releases a domain's in-flight slot on drop
struct InFlightGuard {
    in_flight: Arc<DashMap<String, ()>>,
    domain: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.domain);
    }
}

#[derive(Clone, Copy)]
enum Attempt {
    Create,
    Renew,
}

impl CertificateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the generator serving `policy`.
    pub fn with_generator(
        mut self,
        policy: AutoTls,
        generator: Arc<dyn CertificateGenerator>,
    ) -> Self {
        Arc::make_mut(&mut self.generators).insert(policy, generator);
        self
    }

    /// Domains with an attempt currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn claim(&self, domain: &str) -> Option<InFlightGuard> {
        match self.in_flight.entry(domain.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    domain: domain.to_string(),
                })
            }
        }
    }

    async fn run(
        &self,
        attempt: Attempt,
        policy: AutoTls,
        domain: &str,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        let Some(generator) = self.generators.get(&policy) else {
            warn!(domain = %domain, policy = ?policy, "No certificate generator for policy");
            return Ok(IssuanceOutcome::Unsupported);
        };
        let Some(_guard) = self.claim(domain) else {
            debug!(domain = %domain, "Issuance already in flight");
            return Ok(IssuanceOutcome::InFlight);
        };

        match attempt {
            Attempt::Create => generator.create_new_certificate(domain).await,
            Attempt::Renew => generator.renew(domain).await,
        }
    }

    /// Issue a certificate for `domain` on the current task.
    pub async fn create(
        &self,
        policy: AutoTls,
        domain: &str,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        self.run(Attempt::Create, policy, domain).await
    }

    /// Renew the certificate for `domain` on the current task.
    pub async fn renew(
        &self,
        policy: AutoTls,
        domain: &str,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        self.run(Attempt::Renew, policy, domain).await
    }

    /// Issue a certificate for `domain` on a new task.
    pub fn spawn_create(
        &self,
        policy: AutoTls,
        domain: &str,
    ) -> JoinHandle<Result<IssuanceOutcome, IssuanceError>> {
        let manager = self.clone();
        let domain = domain.to_string();
        tokio::spawn(async move {
            let result = manager.create(policy, &domain).await;
            match &result {
                Ok(outcome) if outcome.is_issued() => {
                    info!(domain = %domain, "Certificate issuance finished");
                }
                Ok(outcome) => {
                    debug!(domain = %domain, outcome = ?outcome, "Certificate issuance ended");
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Certificate issuance aborted");
                }
            }
            result
        })
    }
}

impl CertificateRequester for CertificateManager {
    fn request_certificate(&self, policy: AutoTls, domain: &str) {
        // Detached; the task logs its own result.
        drop(self.spawn_create(policy, domain));
    }
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("policies", &self.generators.keys().collect::<Vec<_>>())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
