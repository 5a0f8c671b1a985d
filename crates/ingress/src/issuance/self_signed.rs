//! Self-signed certificate generator
//!
//! Mints certificates locally for domains that cannot or should not go
//! through a public CA. With a configured CA the leaf is signed by it and
//! stored with the CA certificate as its chain; without one the leaf signs
//! itself.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose,
};
use std::sync::Arc;
use tracing::{debug, info};
use wharf_common::CertificateSource;
use wharf_config::SelfSignedConfig;

use super::{isolate, CertificateGenerator, IssuanceError, IssuanceOutcome};
use crate::table::CertificateTable;

/// Configured signing CA
struct SigningCa {
    pem: String,
    issuer: Issuer<'static, KeyPair>,
}

/// Issues certificates without any external party
pub struct SelfSignedGenerator {
    certificates: Arc<CertificateTable>,
    /// Certificate key pair, PEM
    key_pem: String,
    ca: Option<SigningCa>,
    validity: chrono::Duration,
}

impl SelfSignedGenerator {
    /// Fails when the configured CA certificate or key does not parse.
    pub fn new(
        certificates: Arc<CertificateTable>,
        config: &SelfSignedConfig,
        key_pem: impl Into<String>,
    ) -> Result<Self, IssuanceError> {
        let ca = match config.signing_ca() {
            Some((pem, key)) => {
                let issuer = Issuer::from_ca_cert_pem(pem, KeyPair::from_pem(key)?)?;
                info!("Self-signed certificates will be signed by the configured CA");
                Some(SigningCa {
                    pem: pem.trim_end().to_string() + "\n",
                    issuer,
                })
            }
            None => None,
        };

        Ok(Self {
            certificates,
            key_pem: key_pem.into(),
            ca,
            validity: chrono::Duration::days(i64::from(config.validity_days)),
        })
    }

    /// Mint and store a certificate, overwriting any earlier row.
    fn issue(&self, domain: &str) -> Result<IssuanceOutcome, IssuanceError> {
        let now = Utc::now();
        let ymd = |at: DateTime<Utc>| {
            rcgen::date_time_ymd(at.year(), at.month() as u8, at.day() as u8)
        };

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, domain);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = ymd(now);
        params.not_after = ymd(now + self.validity);

        let key = KeyPair::from_pem(&self.key_pem)?;
        let (chain, signer) = match &self.ca {
            Some(ca) => {
                let leaf = params.signed_by(&key, &ca.issuer)?;
                (format!("{}{}", leaf.pem(), ca.pem), "ca")
            }
            None => (params.self_signed(&key)?.pem(), "self"),
        };

        let not_after = params.not_after.unix_timestamp();
        let expires_at = DateTime::from_timestamp(not_after, 0).ok_or_else(|| {
            IssuanceError::Certificate(format!("notAfter out of range: {}", not_after))
        })?;

        self.certificates.set_certificate(
            domain,
            &self.key_pem,
            &chain,
            expires_at,
            CertificateSource::SelfSigned,
        )?;
        debug!(domain = %domain, signer = signer, "Minted certificate");
        Ok(IssuanceOutcome::Issued { expires_at })
    }
}

#[async_trait]
impl CertificateGenerator for SelfSignedGenerator {
    async fn create_new_certificate(
        &self,
        domain: &str,
    ) -> Result<IssuanceOutcome, IssuanceError> {
        if self.certificates.exist(domain) {
            debug!(domain = %domain, "Certificate already stored");
            return Ok(IssuanceOutcome::AlreadyIssued);
        }
        let result = self.issue(domain);
        if let Ok(IssuanceOutcome::Issued { expires_at }) = &result {
            info!(domain = %domain, expires = %expires_at, "Self-signed certificate issued");
        }
        isolate(domain, result)
    }

    async fn renew(&self, domain: &str) -> Result<IssuanceOutcome, IssuanceError> {
        let result = self.issue(domain);
        if let Ok(IssuanceOutcome::Issued { expires_at }) = &result {
            info!(domain = %domain, expires = %expires_at, "Self-signed certificate renewed");
        }
        isolate(domain, result)
    }
}

impl std::fmt::Debug for SelfSignedGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedGenerator")
            .field("signing_ca", &self.ca.is_some())
            .field("validity_days", &self.validity.num_days())
            .finish()
    }
}
