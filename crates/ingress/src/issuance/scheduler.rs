//! Background certificate renewal scheduler
//!
//! Periodically sweeps the certificate table and renews automatically
//! issued certificates that are close to expiry, each through the policy
//! that issued it. Manually installed certificates are never touched.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wharf_config::AcmeConfig;

use super::{CertificateManager, IssuanceOutcome};
use crate::table::CertificateTable;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay before the first sweep after startup
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Background certificate renewal scheduler
pub struct RenewalScheduler {
    manager: CertificateManager,
    certificates: Arc<CertificateTable>,
    /// Renew this long before expiry
    renew_before: chrono::Duration,
    check_interval: Duration,
}

/// Result of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub renewed: usize,
    pub failed: usize,
}

impl RenewalScheduler {
    pub fn new(
        manager: CertificateManager,
        certificates: Arc<CertificateTable>,
        renew_before: chrono::Duration,
    ) -> Self {
        Self {
            manager,
            certificates,
            renew_before,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn from_config(
        manager: CertificateManager,
        certificates: Arc<CertificateTable>,
        config: &AcmeConfig,
    ) -> Self {
        Self::new(
            manager,
            certificates,
            chrono::Duration::days(i64::from(config.renew_before_days)),
        )
        .with_interval(config.renewal_check_interval())
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 hour.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Run the renewal loop forever.
    pub async fn run(self) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            renew_before_days = self.renew_before.num_days(),
            "Starting certificate renewal scheduler"
        );

        tokio::time::sleep(INITIAL_DELAY).await;

        let mut interval = interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first tick completes immediately.
            interval.tick().await;
            debug!("Running scheduled certificate renewal check");
            self.sweep().await;
        }
    }

    /// Renew every automatic certificate expiring within the window.
    pub async fn sweep(&self) -> SweepReport {
        let due = self.certificates.expiring_within(self.renew_before);
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        info!(due = due.len(), "Checking certificates for renewal");

        for (domain, policy) in &due {
            info!(domain = %domain, policy = ?policy, "Certificate needs renewal");
            match self.manager.renew(*policy, domain).await {
                Ok(IssuanceOutcome::Issued { expires_at }) => {
                    report.renewed += 1;
                    info!(domain = %domain, expires = %expires_at, "Certificate renewed successfully");
                }
                Ok(IssuanceOutcome::InFlight) => {
                    debug!(domain = %domain, "Issuance in flight, renewal skipped");
                }
                Ok(outcome) => {
                    report.failed += 1;
                    warn!(domain = %domain, outcome = ?outcome, "Certificate was not renewed");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(domain = %domain, error = %e, "Certificate renewal failed");
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("renew_before_days", &self.renew_before.num_days())
            .finish()
    }
}
