//! Signed request transport
//!
//! Owns the account key and the anti-replay nonce. Every response's
//! `Replay-Nonce` is kept for the next request; a fresh one is fetched
//! from `newNonce` only when none is held.

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use super::error::{AcmeError, Problem};
use super::jws::{AccountKey, KeyId};

const REPLAY_NONCE: &str = "Replay-Nonce";
const JOSE_JSON: &str = "application/jose+json";

pub(crate) struct Transport {
    http: Client,
    key: AccountKey,
    nonce: Mutex<Option<String>>,
}

impl Transport {
    pub fn new(http: Client, key: AccountKey) -> Self {
        Self {
            http,
            key,
            nonce: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    /// Unsigned GET (directory only).
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AcmeError> {
        let response = self.http.get(url).send().await?;
        let response = check_status(response).await?;
        read_json(response).await
    }

    /// Sign and POST, retrying once on `badNonce`.
    ///
    /// A `payload` of `None` is a POST-as-GET.
    pub async fn post(
        &self,
        nonce_url: &str,
        url: &str,
        key_id: KeyId<'_>,
        payload: Option<&serde_json::Value>,
    ) -> Result<Response, AcmeError> {
        let mut retried = false;
        loop {
            let nonce = self.take_nonce(nonce_url).await?;
            let jws = self.key.sign(key_id, Some(&nonce), url, payload)?;

            trace!(url = %url, "POST signed ACME request");
            let response = self
                .http
                .post(url)
                .header(CONTENT_TYPE, JOSE_JSON)
                .body(serde_json::to_vec(&jws)?)
                .send()
                .await?;
            self.keep_nonce(response.headers());

            match check_status(response).await {
                Ok(response) => return Ok(response),
                Err(AcmeError::Client { problem, .. }) if problem.is_bad_nonce() && !retried => {
                    warn!(url = %url, "CA rejected nonce, retrying with a fresh one");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn take_nonce(&self, nonce_url: &str) -> Result<String, AcmeError> {
        if let Some(nonce) = self.nonce.lock().take() {
            return Ok(nonce);
        }

        debug!(url = %nonce_url, "Fetching fresh ACME nonce");
        let response = self.http.head(nonce_url).send().await?;
        let response = check_status(response).await?;
        nonce_header(response.headers()).ok_or_else(|| {
            AcmeError::MalformedResponse("newNonce response without Replay-Nonce".to_string())
        })
    }

    fn keep_nonce(&self, headers: &HeaderMap) {
        if let Some(nonce) = nonce_header(headers) {
            *self.nonce.lock() = Some(nonce);
        }
    }
}

fn nonce_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REPLAY_NONCE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Pass 2xx through, turn everything else into a classified error.
pub(crate) async fn check_status(response: Response) -> Result<Response, AcmeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let problem = serde_json::from_str::<Problem>(&body).unwrap_or_else(|_| Problem::from_body(&body));
    debug!(status = status.as_u16(), problem = %problem, "CA returned an error");
    Err(AcmeError::from_status(status.as_u16(), problem))
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AcmeError> {
    let url = response.url().to_string();
    let body = response.bytes().await?;
    serde_json::from_slice(&body)
        .map_err(|e| AcmeError::MalformedResponse(format!("{}: {}", url, e)))
}
