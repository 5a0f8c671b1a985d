//! Registry manager
//!
//! Reacts to container and service lifecycle events by mutating the
//! registry and reloading it. Every mutation and its reload run inside
//! one async mutex so overlapping events never interleave a partial
//! configuration write with a reload.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use wharf_common::Service;

use super::{Capabilities, ContainerEvent, Registry, RegistryError};
use crate::issuance::CertificateRequester;
use crate::table::ServiceTable;

/// Drives a [`Registry`] from lifecycle events
pub struct RegistryManager {
    registry: Arc<dyn Registry>,
    capabilities: Capabilities,
    certificates: Arc<dyn CertificateRequester>,
    services: Arc<ServiceTable>,
    mutation: Mutex<()>,
}

impl RegistryManager {
    pub fn new(
        registry: Arc<dyn Registry>,
        certificates: Arc<dyn CertificateRequester>,
        services: Arc<ServiceTable>,
    ) -> Self {
        let capabilities = Capabilities::of(&registry);
        info!(
            registry = registry.name(),
            capabilities = ?capabilities,
            "Registry manager created"
        );
        Self {
            registry,
            capabilities,
            certificates,
            services,
            mutation: Mutex::new(()),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Dispatch one lifecycle event.
    pub async fn handle(&self, event: &ContainerEvent) -> Result<(), RegistryError> {
        match event {
            ContainerEvent::ContainerStart(service) => self.on_container_start(service).await,
            ContainerEvent::ContainerKill(service) => self.on_container_kill(service).await,
            ContainerEvent::ServiceCreate(service) => self.on_service_create(service).await,
            ContainerEvent::ServiceRemove(service) => self.on_service_remove(service).await,
        }
    }

    /// A replica came up: request its certificate, then route to it.
    pub async fn on_container_start(&self, service: &Service) -> Result<(), RegistryError> {
        if !service.is_container() {
            debug!(service = %service.name, "Ignoring container start for service-level target");
            return Ok(());
        }

        if let Some(policy) = service.auto_tls {
            self.certificates
                .request_certificate(policy, &service.domain);
        }

        let _guard = self.mutation.lock().await;
        let id = service.identifier();
        match &self.capabilities.upstreams {
            Some(upstreams) if self.services.exist(&id) => {
                upstreams.add_upstream(service).await?;
                debug!(service = %id, upstream = %service.upstream, "Added upstream");
            }
            _ => {
                self.registry.add_service(service).await?;
                debug!(service = %id, domain = %service.domain, "Added service");
            }
        }
        self.reload().await
    }

    /// A replica went away: stop routing to it.
    pub async fn on_container_kill(&self, service: &Service) -> Result<(), RegistryError> {
        if !service.is_container() {
            debug!(service = %service.name, "Ignoring container kill for service-level target");
            return Ok(());
        }

        let _guard = self.mutation.lock().await;
        let id = service.identifier();
        match &self.capabilities.upstreams {
            Some(upstreams) => {
                upstreams.remove_upstream(service).await?;
                if self.services.upstreams(&id).is_empty() {
                    self.registry.remove_service(service).await?;
                    debug!(service = %id, "Last upstream gone, removed service");
                }
            }
            None => {
                self.registry.remove_service(service).await?;
            }
        }
        self.reload().await
    }

    pub async fn on_service_create(&self, service: &Service) -> Result<(), RegistryError> {
        let _guard = self.mutation.lock().await;
        self.registry.add_service(service).await?;
        self.reload().await
    }

    pub async fn on_service_remove(&self, service: &Service) -> Result<(), RegistryError> {
        let _guard = self.mutation.lock().await;
        self.registry.remove_service(service).await?;
        self.reload().await
    }

    /// Run the registry's startup hook, if it has one.
    pub async fn init(&self) -> Result<(), RegistryError> {
        let Some(initializer) = &self.capabilities.initializer else {
            return Ok(());
        };
        let _guard = self.mutation.lock().await;
        initializer.init().await
    }

    // Callers hold the mutation lock.
    async fn reload(&self) -> Result<(), RegistryError> {
        match &self.capabilities.reloader {
            Some(reloader) => reloader.reload().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RegistryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryManager")
            .field("registry", &self.registry.name())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
