//! ACME protocol support
//!
//! An RFC 8555 client for directory-based CAs such as Let's Encrypt.
//!
//! # Architecture
//!
//! - [`AcmeClient`] - account, order, authorization, finalize and revoke
//!   operations, signed with an [`AccountKey`]
//! - [`ChallengeManager`] - published HTTP-01 responses, shared with the
//!   challenge responder
//! - [`Certificate`] / [`CertificateRequest`] - chains and CSRs
//!
//! # Challenge Flow
//!
//! 1. [`AcmeClient::request_order`] creates an order and collects the
//!    challenges of every authorization
//! 2. The HTTP-01 key authorization is published through the registry
//! 3. [`AcmeClient::challenge_authorization`] asks the CA to validate and
//!    polls until it reaches a verdict
//! 4. [`AcmeClient::finalize_order`] submits the CSR and downloads the
//!    chain

mod certificate;
mod challenge;
mod client;
mod error;
mod jws;
mod transport;
mod types;

pub use certificate::{generate_key_pem, Certificate, CertificateRequest, CertificateResponse};
pub use challenge::{ChallengeManager, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, ExternalAccount, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
pub use error::{AcmeError, Problem};
pub use jws::{AccountKey, Jwk, Jws, KeyId};
pub use types::{
    AccountInfo, AuthorizationChallenge, CertificateOrder, ChallengeState, ChallengeStatus,
    Directory, DirectoryMeta, Identifier, OrderStatus, RevocationReason, HTTP_01,
};

#[cfg(test)]
pub(crate) use certificate::test_certs;
