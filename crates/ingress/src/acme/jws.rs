//! Account key and JWS signing (RFC 7515, RFC 7638, RFC 8555 §6.2)
//!
//! Requests are sent in the flattened JSON serialization and signed with
//! ES256. The JWK thumbprint doubles as the account-specific half of every
//! HTTP-01 key authorization.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use super::error::AcmeError;

type HmacSha256 = Hmac<Sha256>;

/// Public half of the account key as a JWK.
///
/// Field order is the lexicographic member order required for the
/// RFC 7638 thumbprint input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Jwk {
    pub crv: &'static str,
    pub kty: &'static str,
    pub x: String,
    pub y: String,
}

/// Flattened JWS
#[derive(Debug, Clone, Serialize)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// How a request identifies its signer
#[derive(Debug, Clone, Copy)]
pub enum KeyId<'a> {
    /// Embed the JWK; account creation and account lookup only
    Jwk,
    /// Reference the account URL
    Kid(&'a str),
}

#[derive(Serialize)]
struct ProtectedHeader<'a> {
    alg: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<&'a Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<&'a str>,
    url: &'a str,
}

/// ECDSA P-256 account key
pub struct AccountKey {
    secret: SecretKey,
    signing: SigningKey,
    jwk: Jwk,
    thumbprint: String,
}

impl AccountKey {
    /// Generate a fresh key.
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::random(&mut OsRng))
    }

    /// Load a PKCS#8 PEM key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, AcmeError> {
        let secret = SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| AcmeError::Crypto(format!("invalid account key: {}", e)))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let point = secret.public_key().to_encoded_point(false);
        let coordinate = |c: Option<&p256::FieldBytes>| {
            c.map(|bytes| URL_SAFE_NO_PAD.encode(bytes))
                .unwrap_or_default()
        };
        let jwk = Jwk {
            crv: "P-256",
            kty: "EC",
            x: coordinate(point.x()),
            y: coordinate(point.y()),
        };
        let thumbprint = thumbprint(&jwk);
        let signing = SigningKey::from(&secret);
        Self {
            secret,
            signing,
            jwk,
            thumbprint,
        }
    }

    /// Serialize as PKCS#8 PEM.
    pub fn to_pkcs8_pem(&self) -> Result<String, AcmeError> {
        self.secret
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| AcmeError::Crypto(format!("failed to encode account key: {}", e)))
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    /// Base64url SHA-256 JWK thumbprint
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Expected HTTP-01 response body for a token.
    pub fn key_authorization(&self, token: &str) -> String {
        format!("{}.{}", token, self.thumbprint)
    }

    /// Sign a request. `payload` of `None` produces a POST-as-GET body.
    pub fn sign(
        &self,
        key_id: KeyId<'_>,
        nonce: Option<&str>,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Jws, AcmeError> {
        let (jwk, kid) = match key_id {
            KeyId::Jwk => (Some(&self.jwk), None),
            KeyId::Kid(kid) => (None, Some(kid)),
        };
        let header = ProtectedHeader {
            alg: "ES256",
            jwk,
            kid,
            nonce,
            url,
        };
        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = match payload {
            Some(value) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?),
            None => String::new(),
        };

        let signature: Signature = self
            .signing
            .sign(format!("{}.{}", protected, payload).as_bytes());

        Ok(Jws {
            protected,
            payload,
            signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
        })
    }

    /// External account binding over this key's JWK (RFC 8555 §7.3.4).
    ///
    /// `hmac_key` is the base64url key handed out by the CA; padding is
    /// tolerated.
    pub fn external_account_binding(
        &self,
        eab_kid: &str,
        hmac_key: &str,
        url: &str,
    ) -> Result<Jws, AcmeError> {
        let key = URL_SAFE_NO_PAD
            .decode(hmac_key.trim().trim_end_matches('='))
            .map_err(|e| AcmeError::InvalidArgument(format!("external account key: {}", e)))?;

        let header = serde_json::json!({
            "alg": "HS256",
            "kid": eab_kid,
            "url": url,
        });
        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&self.jwk)?);

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| AcmeError::InvalidArgument(format!("external account key: {}", e)))?;
        mac.update(format!("{}.{}", protected, payload).as_bytes());

        Ok(Jws {
            protected,
            payload,
            signature: URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()),
        })
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

fn thumbprint(jwk: &Jwk) -> String {
    // Serialization of a struct of strings cannot fail.
    let canonical = serde_json::to_vec(jwk).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(Sha256::digest(&canonical))
}
