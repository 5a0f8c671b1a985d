//! Application wiring
//!
//! [`Wharf`] opens the tables, loads or creates the persisted keys and
//! assembles the ACME client, registry, certificate manager and registry
//! manager. [`Wharf::run`] then drives them until shutdown.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use wharf_common::AutoTls;
use wharf_config::Config;

use crate::acme::{
    generate_key_pem, AccountInfo, AccountKey, AcmeClient, Certificate, ChallengeManager,
    ExternalAccount, RevocationReason,
};
use crate::issuance::{
    AcmeGenerator, CertificateManager, IssuanceOutcome, IssuanceSettings, RenewalScheduler,
    SelfSignedGenerator,
};
use crate::registry::{
    read_event_lines, Capabilities, EventLoop, LocalRegistry, Registry, RegistryManager,
};
use crate::responder::ChallengeResponder;
use crate::table::{
    CertificateTable, ConfigTable, FileTableStorage, ServiceTable, TableStorage,
    ACME_ACCOUNT_KEY, SSL_PRIVATE_KEY,
};

/// Pending events buffered between the feed and the registry manager
const EVENT_QUEUE: usize = 256;

/// User agent sent to the CA
const USER_AGENT: &str = concat!("wharf/", env!("CARGO_PKG_VERSION"));

/// The assembled controller
pub struct Wharf {
    config: Config,
    certificates: Arc<CertificateTable>,
    client: Arc<AcmeClient>,
    registry: Arc<LocalRegistry>,
    manager: Arc<RegistryManager>,
    certificate_manager: CertificateManager,
}

impl Wharf {
    /// Open file-backed tables under `storage.path` and wire everything.
    pub fn open(config: Config) -> Result<Self> {
        let storage = FileTableStorage::new(&config.storage.path).with_context(|| {
            format!(
                "Failed to open table storage at {}",
                config.storage.path.display()
            )
        })?;
        Self::with_storage(config, Arc::new(storage))
    }

    pub fn with_storage(config: Config, storage: Arc<dyn TableStorage>) -> Result<Self> {
        let tables = &config.tables;
        let certificates = Arc::new(
            CertificateTable::open(tables, storage.clone())
                .context("Failed to open certificate table")?,
        );
        let services = Arc::new(
            ServiceTable::open(tables, storage.clone()).context("Failed to open service table")?,
        );
        let settings =
            ConfigTable::open(tables, storage).context("Failed to open config table")?;

        let account_pem = settings
            .get_or_insert_with::<_, anyhow::Error>(ACME_ACCOUNT_KEY, || {
                info!("Generating ACME account key");
                Ok(AccountKey::generate().to_pkcs8_pem()?)
            })
            .context("Failed to load ACME account key")?;
        let account_key =
            AccountKey::from_pkcs8_pem(&account_pem).context("Stored ACME account key is invalid")?;
        let certificate_key = settings
            .get_or_insert_with::<_, anyhow::Error>(SSL_PRIVATE_KEY, || {
                info!("Generating certificate key pair");
                Ok(generate_key_pem()?)
            })
            .context("Failed to load certificate key pair")?;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        let client = Arc::new(
            AcmeClient::new(http, config.acme.directory_url.as_str(), account_key)
                .with_poll_interval(config.acme.poll_interval()),
        );

        let registry = Arc::new(LocalRegistry::new(
            services.clone(),
            certificates.clone(),
            ChallengeManager::new(),
        ));
        let dyn_registry: Arc<dyn Registry> = registry.clone();
        let capabilities = Capabilities::of(&dyn_registry);

        let acme = AcmeGenerator::new(
            client.clone(),
            certificates.clone(),
            &capabilities,
            certificate_key.as_str(),
            IssuanceSettings::from(&config.acme),
        )
        .context("Failed to create ACME generator")?;
        let self_signed =
            SelfSignedGenerator::new(certificates.clone(), &config.self_signed, certificate_key)
                .context("Failed to load self-signed CA")?;
        let certificate_manager = CertificateManager::new()
            .with_generator(AutoTls::Acme, Arc::new(acme))
            .with_generator(AutoTls::SelfSigned, Arc::new(self_signed));

        let manager = Arc::new(RegistryManager::new(
            dyn_registry,
            Arc::new(certificate_manager.clone()),
            services,
        ));

        info!(
            directory = %config.acme.directory_url,
            thumbprint = %client.account_key().thumbprint(),
            certificates = certificates.len(),
            "Wharf initialized"
        );

        Ok(Self {
            config,
            certificates,
            client,
            registry,
            manager,
            certificate_manager,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LocalRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<RegistryManager> {
        &self.manager
    }

    pub fn certificates(&self) -> &Arc<CertificateTable> {
        &self.certificates
    }

    /// Register the account with the CA, or find the existing one.
    pub async fn register_account(&self) -> Result<AccountInfo> {
        let acme = &self.config.acme;
        let external_account = acme.external_account.as_ref().map(|eab| ExternalAccount {
            id: eab.id.clone(),
            key: eab.key.clone(),
        });
        self.client
            .register_account(Some(acme.email.as_str()), external_account.as_ref())
            .await
            .context("ACME account registration failed")
    }

    /// Run until `shutdown` resolves, reading lifecycle events from
    /// `events`.
    pub async fn run<R, F>(self, events: R, shutdown: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        F: Future<Output = ()>,
    {
        if let Err(e) = self.register_account().await {
            warn!(error = %e, "Continuing without a confirmed ACME account");
        }
        self.manager
            .init()
            .await
            .context("Registry initialization failed")?;

        let mut tasks = JoinSet::new();

        if self.config.responder.enabled {
            let addr = self.config.responder.listen_addr()?;
            let responder = ChallengeResponder::bind(addr, self.registry.challenges().clone())
                .await
                .with_context(|| format!("Failed to bind challenge responder on {}", addr))?;
            tasks.spawn(responder.serve(std::future::pending()));
        } else {
            info!("Built-in challenge responder disabled");
        }

        let scheduler = RenewalScheduler::from_config(
            self.certificate_manager.clone(),
            self.certificates.clone(),
            &self.config.acme,
        );
        tasks.spawn(scheduler.run());

        let (tx, event_loop) = EventLoop::channel(self.manager.clone(), EVENT_QUEUE);
        tasks.spawn(event_loop.run());
        tasks.spawn(async move {
            match read_event_lines(events, tx).await {
                Ok(count) => info!(events = count, "Event feed closed"),
                Err(e) => error!(error = %e, "Event feed failed"),
            }
        });

        info!("Wharf started");
        shutdown.await;
        info!("Shutting down");
        tasks.shutdown().await;
        Ok(())
    }

    /// Renew one domain now, through the policy that issued its stored
    /// certificate. Domains without one go through ACME.
    pub async fn renew(&self, domain: &str) -> Result<IssuanceOutcome> {
        let policy = self
            .certificates
            .certificate(domain)
            .and_then(|record| record.source.policy())
            .unwrap_or(AutoTls::Acme);
        self.certificate_manager
            .renew(policy, domain)
            .await
            .with_context(|| format!("Renewal of {} failed", domain))
    }

    /// Revoke the stored certificate for `domain` and forget it.
    pub async fn revoke(&self, domain: &str, reason: Option<RevocationReason>) -> Result<()> {
        let record = self
            .certificates
            .certificate(domain)
            .with_context(|| format!("No certificate stored for {}", domain))?;
        let certificate = Certificate::from_pem_bundle(&record.certificate)
            .with_context(|| format!("Stored certificate for {} is not PEM", domain))?;

        self.client
            .revoke_certificate(&certificate, reason)
            .await
            .with_context(|| format!("Revocation of {} failed", domain))?;
        self.certificates.delete(domain)?;
        info!(domain = %domain, "Revoked certificate removed from table");
        Ok(())
    }
}

impl std::fmt::Debug for Wharf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wharf")
            .field("directory_url", &self.client.directory_url())
            .field("registry", &self.registry)
            .field("certificate_manager", &self.certificate_manager)
            .finish()
    }
}
