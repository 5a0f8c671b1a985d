//! Wharf Ingress Library
//!
//! An ingress controller for containerized services. Container and service
//! lifecycle events program a reverse-proxy registry, and TLS certificates
//! are provisioned and renewed automatically through ACME HTTP-01.
//!
//! - **ACME**: RFC 8555 client with ES256 account keys, external account
//!   binding and certificate chain handling
//! - **Issuance**: reachability-checked HTTP-01 issuance, locally minted
//!   self-signed certificates, per-attempt isolation and background renewal
//! - **Registry**: capability-based registry manager with upstream
//!   refcounting and serialized reloads
//! - **Tables**: bounded, fixed-schema concurrent tables with durable
//!   snapshots
//!
//! # Example
//!
//! ```ignore
//! use wharf_config::Config;
//! use wharf_ingress::Wharf;
//!
//! let wharf = Wharf::open(Config::load(None)?)?;
//! wharf.run(tokio::io::BufReader::new(tokio::io::stdin()), shutdown).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod app;
pub mod issuance;
pub mod registry;
pub mod responder;
pub mod table;

#[cfg(test)]
mod testing;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use app::Wharf;

// ACME client
pub use acme::{AccountKey, AcmeClient, AcmeError, ChallengeManager};

// Issuance
pub use issuance::{
    AcmeGenerator, CertificateGenerator, CertificateManager, CertificateRequester,
    IssuanceError, IssuanceOutcome, RenewalScheduler, SelfSignedGenerator,
};

// Registry
pub use registry::{
    Capabilities, ContainerEvent, EventLoop, LocalRegistry, Registry, RegistryError,
    RegistryManager,
};

// HTTP-01 responder
pub use responder::ChallengeResponder;

// Tables
pub use table::{CertificateTable, ConfigTable, ServiceTable, TableError};
