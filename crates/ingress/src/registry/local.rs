//! In-process registry
//!
//! Keeps virtual hosts in memory, counts upstreams through the service
//! table and publishes HTTP-01 responses into a [`ChallengeManager`]
//! shared with the challenge responder. `reload` renders the current state
//! into an immutable [`RoutingSnapshot`] and swaps it in atomically.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use wharf_common::{Service, ServiceId};

use super::{
    Capabilities, HttpChallengeResponder, Initializer, Registry, RegistryError, Reloadable,
    UpstreamManager,
};
use crate::acme::ChallengeManager;
use crate::table::{CertificateTable, ServiceTable};

/// One routed domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub service: ServiceId,
    pub domain: String,
    pub upstreams: BTreeSet<String>,
    /// A certificate is stored for the domain
    pub tls: bool,
}

/// Routing state published by one reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingSnapshot {
    pub generation: u64,
    pub hosts: Vec<VirtualHost>,
}

impl RoutingSnapshot {
    pub fn host(&self, domain: &str) -> Option<&VirtualHost> {
        self.hosts.iter().find(|h| h.domain == domain)
    }
}

/// In-process registry implementing every capability
pub struct LocalRegistry {
    /// service identifier -> domain
    hosts: DashMap<ServiceId, String>,
    services: Arc<ServiceTable>,
    certificates: Arc<CertificateTable>,
    challenges: ChallengeManager,
    snapshot: ArcSwap<RoutingSnapshot>,
    generation: AtomicU64,
}

impl LocalRegistry {
    pub fn new(
        services: Arc<ServiceTable>,
        certificates: Arc<CertificateTable>,
        challenges: ChallengeManager,
    ) -> Self {
        Self {
            hosts: DashMap::new(),
            services,
            certificates,
            challenges,
            snapshot: ArcSwap::from_pointee(RoutingSnapshot::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Challenge store shared with the HTTP responder.
    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    /// State published by the last reload.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    /// Number of reloads so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn render(&self, generation: u64) -> RoutingSnapshot {
        let mut hosts: Vec<VirtualHost> = self
            .hosts
            .iter()
            .map(|entry| VirtualHost {
                service: entry.key().clone(),
                domain: entry.value().clone(),
                upstreams: self.services.upstreams(entry.key()),
                tls: self.certificates.exist(entry.value()),
            })
            .collect();
        hosts.sort_by(|a, b| a.domain.cmp(&b.domain));
        RoutingSnapshot { generation, hosts }
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn add_service(&self, service: &Service) -> Result<(), RegistryError> {
        let id = service.identifier();
        if id.as_str().is_empty() {
            return Err(RegistryError::Rejected {
                service: service.name.clone(),
                reason: "empty identifier".to_string(),
            });
        }

        self.hosts.insert(id.clone(), service.domain.clone());
        if !service.upstream.is_empty() {
            self.services.add_upstream(&id, &service.upstream)?;
        }
        debug!(service = %id, domain = %service.domain, "Virtual host added");
        Ok(())
    }

    async fn remove_service(&self, service: &Service) -> Result<(), RegistryError> {
        let id = service.identifier();
        if !service.upstream.is_empty() {
            self.services.remove_upstream(&id, &service.upstream)?;
        }
        if self.hosts.remove(&id).is_some() {
            debug!(service = %id, domain = %service.domain, "Virtual host removed");
        }
        Ok(())
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities {
            upstreams: Some(self.clone()),
            reloader: Some(self.clone()),
            initializer: Some(self.clone()),
            http_challenge: Some(self),
        }
    }
}

#[async_trait]
impl UpstreamManager for LocalRegistry {
    async fn add_upstream(&self, service: &Service) -> Result<(), RegistryError> {
        let id = service.identifier();
        self.hosts
            .entry(id.clone())
            .or_insert_with(|| service.domain.clone());
        self.services.add_upstream(&id, &service.upstream)?;
        Ok(())
    }

    async fn remove_upstream(&self, service: &Service) -> Result<(), RegistryError> {
        self.services
            .remove_upstream(&service.identifier(), &service.upstream)?;
        Ok(())
    }
}

#[async_trait]
impl Reloadable for LocalRegistry {
    async fn reload(&self) -> Result<(), RegistryError> {
        let start = Instant::now();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = self.render(generation);
        let hosts = snapshot.hosts.len();
        self.snapshot.store(Arc::new(snapshot));

        info!(
            generation = generation,
            hosts = hosts,
            elapsed_us = start.elapsed().as_micros() as u64,
            "Routing configuration reloaded"
        );
        Ok(())
    }
}

#[async_trait]
impl Initializer for LocalRegistry {
    async fn init(&self) -> Result<(), RegistryError> {
        // Challenges from a previous run are stale.
        self.challenges.clear();
        info!(
            services = self.services.services().len(),
            certificates = self.certificates.len(),
            "Local registry initialized"
        );
        Ok(())
    }
}

#[async_trait]
impl HttpChallengeResponder for LocalRegistry {
    async fn serve_http_challenge(
        &self,
        domain: &str,
        token: &str,
        payload: &str,
    ) -> Result<(), RegistryError> {
        self.challenges.add_challenge(domain, token, payload);
        Ok(())
    }

    async fn cleanup(&self, domain: &str) -> Result<(), RegistryError> {
        self.challenges.remove_domain(domain);
        Ok(())
    }
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRegistry")
            .field("hosts", &self.hosts.len())
            .field("generation", &self.generation())
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTableStorage;
    use wharf_config::TableConfig;

    fn local_registry() -> Arc<LocalRegistry> {
        let storage = Arc::new(MemoryTableStorage::new());
        let config = TableConfig::default();
        Arc::new(LocalRegistry::new(
            Arc::new(ServiceTable::open(&config, storage.clone()).unwrap()),
            Arc::new(CertificateTable::open(&config, storage).unwrap()),
            ChallengeManager::new(),
        ))
    }

    #[tokio::test]
    async fn test_reload_publishes_snapshot() {
        let registry = local_registry();
        let web = Service::container("web", "web.example.com", "10.0.0.2:80");
        registry.add_service(&web).await.unwrap();
        assert!(registry.snapshot().hosts.is_empty());

        registry.reload().await.unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.generation, 1);
        let host = snapshot.host("web.example.com").unwrap();
        assert_eq!(host.upstreams.len(), 1);
        assert!(!host.tls);
    }

    #[tokio::test]
    async fn test_upstreams_are_counted_per_service() {
        let registry = local_registry();
        let a = Service::container("web", "web.example.com", "10.0.0.2:80");
        let b = Service::container("web", "web.example.com", "10.0.0.3:80");
        registry.add_service(&a).await.unwrap();
        registry.add_upstream(&b).await.unwrap();
        registry.reload().await.unwrap();
        assert_eq!(
            registry.snapshot().host("web.example.com").unwrap().upstreams.len(),
            2
        );

        registry.remove_upstream(&a).await.unwrap();
        registry.remove_service(&b).await.unwrap();
        registry.reload().await.unwrap();
        assert!(registry.snapshot().hosts.is_empty());
        assert!(!registry.services.exist(&a.identifier()));
    }

    #[tokio::test]
    async fn test_capabilities_are_complete() {
        let registry: Arc<dyn Registry> = local_registry();
        let caps = Capabilities::of(&registry);
        assert!(caps.upstreams.is_some());
        assert!(caps.reloader.is_some());
        assert!(caps.initializer.is_some());
        assert!(caps.http_challenge.is_some());
    }

    #[tokio::test]
    async fn test_challenge_publication_and_cleanup() {
        let registry = local_registry();
        registry
            .serve_http_challenge("app.example.com", "tok", "tok.thumb")
            .await
            .unwrap();
        assert_eq!(
            registry.challenges().get_response("app.example.com", "tok"),
            Some("tok.thumb".to_string())
        );

        registry.cleanup("app.example.com").await.unwrap();
        assert_eq!(
            registry.challenges().get_response("app.example.com", "tok"),
            None
        );
    }

    #[tokio::test]
    async fn test_cleanup_keeps_other_domain_dummy() {
        let registry = local_registry();
        registry
            .serve_http_challenge("a.example.com", "dummy", "dummy")
            .await
            .unwrap();
        registry
            .serve_http_challenge("b.example.com", "dummy", "dummy")
            .await
            .unwrap();

        registry.cleanup("a.example.com").await.unwrap();

        assert_eq!(registry.challenges().get_response("a.example.com", "dummy"), None);
        assert_eq!(
            registry.challenges().get_response("b.example.com", "dummy"),
            Some("dummy".to_string())
        );
    }

    #[tokio::test]
    async fn test_init_clears_stale_challenges() {
        let registry = local_registry();
        registry.challenges().add_challenge("a.example.com", "old", "old");
        registry.init().await.unwrap();
        assert_eq!(registry.challenges().pending_count(), 0);
    }
}
