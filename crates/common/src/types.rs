//! Ingress targets and certificate policy types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ServiceId;

/// How an ingress target is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// An orchestrator-level service (e.g. a swarm service with a VIP).
    /// Container lifecycle events are ignored for these.
    Service,
    /// A container-backed target; each running replica is one upstream.
    #[default]
    Container,
}

/// Automatic TLS policy requested by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoTls {
    /// Issue and renew through the ACME HTTP-01 flow.
    Acme,
    /// Mint locally, signed by the configured CA or by the certificate
    /// itself.
    SelfSigned,
}

/// Where a stored certificate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateSource {
    /// Uploaded by an operator; never renewed automatically.
    Manual,
    /// Issued by the ACME pipeline.
    Acme,
    /// Minted locally by the self-signed generator.
    SelfSigned,
}

impl CertificateSource {
    /// Integer flag stored in the certificate table `auto` column.
    pub fn as_flag(self) -> i64 {
        match self {
            CertificateSource::Manual => 0,
            CertificateSource::Acme => 1,
            CertificateSource::SelfSigned => 2,
        }
    }

    /// Decode the `auto` column. Unknown non-zero values mean ACME.
    pub fn from_flag(flag: i64) -> Self {
        match flag {
            0 => CertificateSource::Manual,
            2 => CertificateSource::SelfSigned,
            _ => CertificateSource::Acme,
        }
    }

    /// Policy that renews certificates from this source, if any.
    pub fn policy(self) -> Option<AutoTls> {
        match self {
            CertificateSource::Manual => None,
            CertificateSource::Acme => Some(AutoTls::Acme),
            CertificateSource::SelfSigned => Some(AutoTls::SelfSigned),
        }
    }
}

impl From<AutoTls> for CertificateSource {
    fn from(policy: AutoTls) -> Self {
        match policy {
            AutoTls::Acme => CertificateSource::Acme,
            AutoTls::SelfSigned => CertificateSource::SelfSigned,
        }
    }
}

/// Invalid service descriptor
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service name is empty")]
    EmptyName,

    #[error("invalid domain '{0}'")]
    InvalidDomain(String),

    #[error("container service '{0}' has no upstream address")]
    MissingUpstream(String),
}

/// An ingress target.
///
/// Built from container or service events and passed by value into the
/// registry manager. The identifier is derived from `name`, so every
/// replica of one service maps to the same service-table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Logical service name shared by all replicas
    pub name: String,
    /// Public domain routed to this service
    pub domain: String,
    /// Service-level or container-backed
    #[serde(default)]
    pub kind: ServiceKind,
    /// Automatic TLS policy; `None` leaves certificates alone
    #[serde(default)]
    pub auto_tls: Option<AutoTls>,
    /// Backend address of this replica (`host:port`)
    #[serde(default)]
    pub upstream: String,
}

impl Service {
    /// A container-backed target.
    pub fn container(
        name: impl Into<String>,
        domain: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            kind: ServiceKind::Container,
            auto_tls: None,
            upstream: upstream.into(),
        }
    }

    /// An orchestrator-level service target.
    pub fn service(
        name: impl Into<String>,
        domain: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            kind: ServiceKind::Service,
            ..Self::container(name, domain, upstream)
        }
    }

    /// Request automatic TLS for this target.
    pub fn with_auto_tls(mut self, policy: AutoTls) -> Self {
        self.auto_tls = Some(policy);
        self
    }

    /// Identifier shared by every replica of this service.
    pub fn identifier(&self) -> ServiceId {
        ServiceId::derive(&self.name)
    }

    /// Whether container lifecycle events apply to this target.
    pub fn is_container(&self) -> bool {
        self.kind == ServiceKind::Container
    }

    /// Reject descriptors the registry could not route.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.identifier().as_str().is_empty() {
            return Err(ServiceError::EmptyName);
        }
        if !is_valid_domain(&self.domain) {
            return Err(ServiceError::InvalidDomain(self.domain.clone()));
        }
        if self.is_container() && self.upstream.trim().is_empty() {
            return Err(ServiceError::MissingUpstream(self.name.clone()));
        }
        Ok(())
    }
}

/// Loose hostname check: non-empty labels of `[A-Za-z0-9-]`, no leading
/// or trailing hyphen, at most 253 bytes.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicas_share_identifier() {
        let a = Service::container("shop-web", "shop.example.com", "10.0.0.2:80");
        let b = Service::container("shop-web", "shop.example.com", "10.0.0.3:80");
        assert_eq!(a.identifier(), b.identifier());
        assert_ne!(a.upstream, b.upstream);
    }

    #[test]
    fn test_service_kind() {
        let svc = Service::service("api", "api.example.com", "api:8080");
        assert!(!svc.is_container());
        assert!(Service::container("api", "api.example.com", "10.0.0.2:8080").is_container());
    }

    #[test]
    fn test_deserialize_event_payload() {
        let svc: Service = serde_json::from_str(
            r#"{"name":"blog","domain":"blog.example.com","auto_tls":"acme","upstream":"172.17.0.4:2368"}"#,
        )
        .unwrap();
        assert_eq!(svc.kind, ServiceKind::Container);
        assert_eq!(svc.auto_tls, Some(AutoTls::Acme));
        assert_eq!(svc.identifier().as_str(), "blog");
    }

    #[test]
    fn test_validate() {
        let ok = Service::container("blog", "blog.example.com", "10.0.0.2:80");
        assert_eq!(ok.validate(), Ok(()));

        let bad_domain = Service::container("blog", "http://blog", "10.0.0.2:80");
        assert!(matches!(
            bad_domain.validate(),
            Err(ServiceError::InvalidDomain(_))
        ));

        let no_upstream = Service::container("blog", "blog.example.com", " ");
        assert!(matches!(
            no_upstream.validate(),
            Err(ServiceError::MissingUpstream(_))
        ));

        let no_name = Service::container("--", "blog.example.com", "10.0.0.2:80");
        assert_eq!(no_name.validate(), Err(ServiceError::EmptyName));
    }

    #[test]
    fn test_certificate_source_flag() {
        assert_eq!(CertificateSource::Acme.as_flag(), 1);
        assert_eq!(CertificateSource::from_flag(0), CertificateSource::Manual);
        assert_eq!(CertificateSource::from_flag(7), CertificateSource::Acme);
        assert_eq!(CertificateSource::SelfSigned.as_flag(), 2);
        assert_eq!(CertificateSource::from_flag(2), CertificateSource::SelfSigned);
    }

    #[test]
    fn test_policy_round_trip() {
        assert_eq!(CertificateSource::Manual.policy(), None);
        for policy in [AutoTls::Acme, AutoTls::SelfSigned] {
            assert_eq!(CertificateSource::from(policy).policy(), Some(policy));
        }
        let svc: Service = serde_json::from_str(
            r#"{"name":"lab","domain":"lab.internal","auto_tls":"self_signed","upstream":"10.0.0.9:80"}"#,
        )
        .unwrap();
        assert_eq!(svc.auto_tls, Some(AutoTls::SelfSigned));
    }
}
