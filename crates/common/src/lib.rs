//! Wharf common types.
//!
//! The service model shared by the configuration loader and the ingress
//! controller: service identifiers, ingress targets and certificate policy.

pub mod ids;
pub mod types;

pub use ids::ServiceId;
pub use types::{is_valid_domain, AutoTls, CertificateSource, Service, ServiceError, ServiceKind};
