//! Certificate chains and signing requests

use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fmt;
use x509_parser::pem::Pem;

use super::error::AcmeError;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";

// =============================================================================
// Certificate chain
// =============================================================================

/// One certificate in a chain, owning its issuer.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pem: String,
    issuer: Option<Box<Certificate>>,
}

impl Certificate {
    pub fn new(pem: impl Into<String>, issuer: Option<Certificate>) -> Self {
        Self {
            pem: pem.into(),
            issuer: issuer.map(Box::new),
        }
    }

    /// Build a chain from a concatenated PEM bundle, leaf first.
    ///
    /// Returns `None` when the bundle holds no certificate block.
    pub fn from_pem_bundle(bundle: &str) -> Option<Self> {
        let blocks: Vec<String> = bundle
            .split(PEM_BEGIN)
            .skip(1)
            .map(|body| format!("{}{}\n", PEM_BEGIN, body.trim_end()))
            .collect();

        blocks
            .into_iter()
            .rev()
            .fold(None, |issuer, pem| Some(Certificate::new(pem, issuer)))
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn issuer(&self) -> Option<&Certificate> {
        self.issuer.as_deref()
    }

    /// This certificate followed by every issuer above it.
    pub fn chain(&self) -> impl Iterator<Item = &Certificate> {
        std::iter::successors(Some(self), |cert| cert.issuer())
    }

    /// Issuers only, nearest first.
    pub fn issuer_chain(&self) -> impl Iterator<Item = &Certificate> {
        self.chain().skip(1)
    }

    /// Leaf plus issuers as one PEM bundle.
    pub fn full_chain_pem(&self) -> String {
        self.chain().map(Certificate::pem).collect()
    }

    /// DER bytes of this certificate.
    pub fn to_der(&self) -> Result<Vec<u8>, AcmeError> {
        Ok(self.parse_pem()?.contents)
    }

    /// `notAfter` of this certificate.
    pub fn not_after(&self) -> Result<DateTime<Utc>, AcmeError> {
        let pem = self.parse_pem()?;
        let x509 = pem
            .parse_x509()
            .map_err(|e| AcmeError::Crypto(format!("invalid certificate: {}", e)))?;
        let timestamp = x509.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| AcmeError::Crypto(format!("notAfter out of range: {}", timestamp)))
    }

    fn parse_pem(&self) -> Result<Pem, AcmeError> {
        Pem::iter_from_buffer(self.pem.as_bytes())
            .next()
            .ok_or_else(|| AcmeError::Crypto("empty certificate PEM".to_string()))?
            .map_err(|e| AcmeError::Crypto(format!("invalid certificate PEM: {}", e)))
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("pem_len", &self.pem.len())
            .field("issuer", &self.issuer)
            .finish()
    }
}

// =============================================================================
// Signing request
// =============================================================================

/// Subject names plus the certificate key pair.
#[derive(Clone)]
pub struct CertificateRequest {
    common_name: String,
    subject_alternative_names: Vec<String>,
    key_pem: String,
}

impl CertificateRequest {
    /// Request covering a single domain.
    pub fn new(domain: impl Into<String>, key_pem: impl Into<String>) -> Self {
        let common_name = domain.into();
        Self {
            subject_alternative_names: vec![common_name.clone()],
            common_name,
            key_pem: key_pem.into(),
        }
    }

    /// Add subject alternative names; duplicates are dropped.
    pub fn with_alternative_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if !self.subject_alternative_names.contains(&name) {
                self.subject_alternative_names.push(name);
            }
        }
        self
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn subject_alternative_names(&self) -> &[String] {
        &self.subject_alternative_names
    }

    /// Certificate private key, PEM.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// DER-encoded PKCS#10 request.
    pub fn to_der(&self) -> Result<Vec<u8>, AcmeError> {
        let key_pair = KeyPair::from_pem(&self.key_pem)?;
        let mut params = CertificateParams::new(self.subject_alternative_names.clone())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key_pair)?;
        Ok(csr.der().as_ref().to_vec())
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("common_name", &self.common_name)
            .field("subject_alternative_names", &self.subject_alternative_names)
            .finish_non_exhaustive()
    }
}

/// Generate a certificate key pair as PEM.
pub fn generate_key_pem() -> Result<String, AcmeError> {
    Ok(KeyPair::generate()?.serialize_pem())
}

/// An issued certificate with the request that produced it.
#[derive(Debug, Clone)]
pub struct CertificateResponse {
    pub csr: CertificateRequest,
    pub certificate: Certificate,
}

#[cfg(test)]
pub(crate) mod test_certs {
    //! rcgen-minted chains for tests.

    use rcgen::{BasicConstraints, CertificateParams, IsCa, Issuer, KeyPair};

    pub struct MintedChain {
        pub leaf: String,
        pub intermediate: String,
        pub root: String,
        pub not_after: chrono::DateTime<chrono::Utc>,
    }

    impl MintedChain {
        pub fn bundle(&self) -> String {
            format!("{}\n{}\n{}", self.leaf, self.intermediate, self.root)
        }
    }

    fn ca_params(name: &str) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
    }

    /// Leaf for `domain` signed by an intermediate signed by a root.
    pub fn mint_chain(domain: &str) -> MintedChain {
        let root_key = KeyPair::generate().unwrap();
        let root_params = ca_params("Test Root");
        let root = root_params.self_signed(&root_key).unwrap();
        let root_issuer = Issuer::new(root_params, root_key);

        let inter_key = KeyPair::generate().unwrap();
        let inter_params = ca_params("Test Intermediate");
        let inter = inter_params.signed_by(&inter_key, &root_issuer).unwrap();
        let inter_issuer = Issuer::new(inter_params, inter_key);

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        let not_after = rcgen::date_time_ymd(2031, 6, 15);
        leaf_params.not_after = not_after;
        let leaf = leaf_params.signed_by(&leaf_key, &inter_issuer).unwrap();

        MintedChain {
            leaf: leaf.pem(),
            intermediate: inter.pem(),
            root: root.pem(),
            not_after: chrono::DateTime::from_timestamp(not_after.unix_timestamp(), 0).unwrap(),
        }
    }
}
