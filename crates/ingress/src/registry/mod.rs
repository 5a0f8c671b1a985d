//! Reverse-proxy registries
//!
//! A [`Registry`] turns services into proxy configuration. Beyond adding
//! and removing services, a registry may offer optional capabilities:
//!
//! - [`UpstreamManager`] - grow and shrink a service's upstream set
//! - [`Reloadable`] - apply pending configuration
//! - [`Initializer`] - one-time setup at startup
//! - [`HttpChallengeResponder`] - publish HTTP-01 responses
//!
//! The capabilities a registry offers are collected once into a
//! [`Capabilities`] descriptor, which the registry manager and the ACME
//! generator hold instead of probing the registry on every call.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use wharf_common::Service;

use crate::table::TableError;

mod events;
mod local;
mod manager;

pub use events::{read_event_lines, ContainerEvent, EventLoop};
pub use local::{LocalRegistry, RoutingSnapshot, VirtualHost};
pub use manager::RegistryManager;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("table error: {0}")]
    Table(#[from] TableError),

    #[error("registry rejected service '{service}': {reason}")]
    Rejected { service: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A reverse-proxy configuration backend
#[async_trait]
pub trait Registry: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn add_service(&self, service: &Service) -> Result<(), RegistryError>;

    async fn remove_service(&self, service: &Service) -> Result<(), RegistryError>;

    /// Optional capabilities of this registry. Queried once.
    fn capabilities(self: Arc<Self>) -> Capabilities {
        Capabilities::default()
    }
}

/// Upstream set management
#[async_trait]
pub trait UpstreamManager: Send + Sync {
    async fn add_upstream(&self, service: &Service) -> Result<(), RegistryError>;

    async fn remove_upstream(&self, service: &Service) -> Result<(), RegistryError>;
}

/// Applies pending configuration
#[async_trait]
pub trait Reloadable: Send + Sync {
    async fn reload(&self) -> Result<(), RegistryError>;
}

/// One-time startup hook
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn init(&self) -> Result<(), RegistryError>;
}

/// Publishes HTTP-01 challenge responses for a domain
#[async_trait]
pub trait HttpChallengeResponder: Send + Sync {
    /// Serve `payload` at `/.well-known/acme-challenge/{token}` for
    /// `domain`, replacing anything published for it before.
    async fn serve_http_challenge(
        &self,
        domain: &str,
        token: &str,
        payload: &str,
    ) -> Result<(), RegistryError>;

    /// Withdraw the challenge published for `domain`.
    async fn cleanup(&self, domain: &str) -> Result<(), RegistryError>;
}

/// Optional capabilities of a registry
#[derive(Clone, Default)]
pub struct Capabilities {
    pub upstreams: Option<Arc<dyn UpstreamManager>>,
    pub reloader: Option<Arc<dyn Reloadable>>,
    pub initializer: Option<Arc<dyn Initializer>>,
    pub http_challenge: Option<Arc<dyn HttpChallengeResponder>>,
}

impl Capabilities {
    /// Capabilities of `registry`.
    pub fn of(registry: &Arc<dyn Registry>) -> Self {
        Arc::clone(registry).capabilities()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("upstreams", &self.upstreams.is_some())
            .field("reloader", &self.reloader.is_some())
            .field("initializer", &self.initializer.is_some())
            .field("http_challenge", &self.http_challenge.is_some())
            .finish()
    }
}
