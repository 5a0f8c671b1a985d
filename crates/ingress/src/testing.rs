//! Test fixtures: a wiremock ACME CA and fake registries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use async_trait::async_trait;
use wharf_common::{AutoTls, Service};

use crate::acme::{AccountKey, AcmeClient};
use crate::issuance::CertificateRequester;
use crate::registry::{
    Capabilities, HttpChallengeResponder, Initializer, Registry, RegistryError, Reloadable,
    UpstreamManager,
};
use crate::table::ServiceTable;

const NONCE: &str = "test-nonce";

/// A JWS request captured by the mock CA
pub struct RecordedJws(Value);

impl RecordedJws {
    fn segment(&self, name: &str) -> Value {
        let encoded = self.0[name].as_str().unwrap_or_default();
        if encoded.is_empty() {
            return Value::Null;
        }
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap()
    }

    pub fn protected(&self) -> Value {
        self.segment("protected")
    }

    pub fn payload(&self) -> Value {
        self.segment("payload")
    }
}

/// Shared order status, advanced by finalize and by later polls.
struct OrderState {
    base: String,
    domains: Vec<String>,
    status: Mutex<String>,
    after_finalize: Mutex<VecDeque<String>>,
    finalized: AtomicBool,
}

impl OrderState {
    fn body(&self) -> Value {
        let status = self.status.lock().clone();
        let mut body = json!({
            "status": status,
            "identifiers": self
                .domains
                .iter()
                .map(|domain| json!({"type": "dns", "value": domain}))
                .collect::<Vec<_>>(),
            "authorizations": (1..=self.domains.len())
                .map(|n| format!("{}/authz/{}", self.base, n))
                .collect::<Vec<_>>(),
            "finalize": format!("{}/order/1/finalize", self.base),
        });
        if status == "valid" {
            body["certificate"] = json!(format!("{}/cert/1", self.base));
        }
        body
    }

    fn advance(&self) {
        if let Some(next) = self.after_finalize.lock().pop_front() {
            *self.status.lock() = next;
        }
    }
}

struct OrderPoll(Arc<OrderState>);

impl Respond for OrderPoll {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.0.finalized.load(Ordering::SeqCst) {
            self.0.advance();
        }
        nonce_template(200).set_body_json(self.0.body())
    }
}

struct Finalize(Arc<OrderState>);

impl Respond for Finalize {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.0.finalized.store(true, Ordering::SeqCst);
        self.0.advance();
        nonce_template(200).set_body_json(self.0.body())
    }
}

fn nonce_template(status: u16) -> ResponseTemplate {
    ResponseTemplate::new(status).insert_header("Replay-Nonce", NONCE)
}

/// wiremock standing in for an ACME CA
pub struct MockCa {
    pub server: MockServer,
    order: Mutex<Option<Arc<OrderState>>>,
}

impl MockCa {
    /// Directory, nonce and account endpoints.
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Same as [`MockCa::start`] without a `revokeCert` endpoint.
    pub async fn start_without_revoke() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(revoke: bool) -> Self {
        let server = MockServer::start().await;
        let base = server.uri();

        let mut directory = json!({
            "newNonce": format!("{}/new-nonce", base),
            "newAccount": format!("{}/new-acct", base),
            "newOrder": format!("{}/new-order", base),
            "meta": {"termsOfService": "https://ca.test/tos"}
        });
        if revoke {
            directory["revokeCert"] = json!(format!("{}/revoke-cert", base));
        }

        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(directory))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new-nonce"))
            .respond_with(nonce_template(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/new-acct"))
            .respond_with(
                nonce_template(200)
                    .insert_header("Location", format!("{}/acct/1", base).as_str())
                    .set_body_json(json!({"status": "valid"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/acct/1"))
            .respond_with(nonce_template(200).set_body_json(json!({
                "status": "valid",
                "contact": ["mailto:ops@example.com"],
                "orders": format!("{}/acct/1/orders", base)
            })))
            .mount(&server)
            .await;

        Self {
            server,
            order: Mutex::new(None),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub fn directory_url(&self) -> String {
        self.url("/directory")
    }

    /// Response template carrying a fresh nonce.
    pub fn respond(&self, status: u16) -> ResponseTemplate {
        nonce_template(status)
    }

    /// Client with a fresh account key and a fast poll interval.
    pub fn client(&self) -> AcmeClient {
        AcmeClient::new(
            reqwest::Client::new(),
            self.directory_url(),
            AccountKey::generate(),
        )
        .with_poll_interval(Duration::from_millis(10))
    }

    /// New-order, order and authorization endpoints for one domain.
    ///
    /// The authorization carries an `http-01` challenge at `/chal/http`
    /// (token `token-http`) and a `dns-01` challenge at `/chal/dns`.
    pub async fn mount_order(&self, domain: &str, status: &str, wildcard: bool) {
        self.mount_order_with(&[domain], status, wildcard).await;
    }

    /// Same as [`MockCa::mount_order`] with one authorization per domain.
    ///
    /// The first domain gets `/authz/1` with the challenges described
    /// above; domain `n` (1-based) gets `/authz/n`, `/chal/http/n`
    /// (token `token-http-n`) and `/chal/dns/n`.
    pub async fn mount_order_for(&self, domains: &[&str], status: &str) {
        self.mount_order_with(domains, status, false).await;
    }

    async fn mount_order_with(&self, domains: &[&str], status: &str, wildcard: bool) {
        let state = Arc::new(OrderState {
            base: self.server.uri(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            status: Mutex::new(status.to_string()),
            after_finalize: Mutex::new(VecDeque::new()),
            finalized: AtomicBool::new(false),
        });
        *self.order.lock() = Some(Arc::clone(&state));

        Mock::given(method("POST"))
            .and(path("/new-order"))
            .respond_with(
                nonce_template(201)
                    .insert_header("Location", self.url("/order/1").as_str())
                    .set_body_json(state.body()),
            )
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/order/1"))
            .respond_with(OrderPoll(Arc::clone(&state)))
            .mount(&self.server)
            .await;
        for (index, domain) in domains.iter().enumerate() {
            let n = index + 1;
            let suffix = if n == 1 { String::new() } else { format!("/{}", n) };
            let token_suffix = if n == 1 { String::new() } else { format!("-{}", n) };
            Mock::given(method("POST"))
                .and(path(format!("/authz/{}", n)))
                .respond_with(nonce_template(200).set_body_json(json!({
                    "status": "pending",
                    "identifier": {"type": "dns", "value": domain},
                    "wildcard": wildcard,
                    "challenges": [
                        {
                            "type": "dns-01",
                            "url": self.url(&format!("/chal/dns{}", suffix)),
                            "status": "pending",
                            "token": format!("token-dns{}", token_suffix)
                        },
                        {
                            "type": "http-01",
                            "url": self.url(&format!("/chal/http{}", suffix)),
                            "status": "pending",
                            "token": format!("token-http{}", token_suffix)
                        }
                    ]
                })))
                .mount(&self.server)
                .await;
        }
    }

    /// Finalize and certificate endpoints.
    ///
    /// Finalize moves the order to the first stage; each later order poll
    /// moves it to the next one. The last stage sticks. The certificate
    /// resource advertises an alternate chain at `/cert/1/alt`.
    pub async fn mount_finalize(&self, stages: &[(&str, Option<&String>)]) {
        let Some(state) = self.order.lock().clone() else {
            panic!("mount_order must be called first");
        };
        state
            .after_finalize
            .lock()
            .extend(stages.iter().map(|(status, _)| status.to_string()));

        Mock::given(method("POST"))
            .and(path("/order/1/finalize"))
            .respond_with(Finalize(state))
            .mount(&self.server)
            .await;

        if let Some(bundle) = stages.iter().find_map(|(_, bundle)| *bundle) {
            Mock::given(method("POST"))
                .and(path("/cert/1"))
                .respond_with(
                    nonce_template(200)
                        .insert_header(
                            "Link",
                            format!("<{}>;rel=\"alternate\"", self.url("/cert/1/alt")).as_str(),
                        )
                        .set_body_string(bundle.clone()),
                )
                .mount(&self.server)
                .await;
        }
    }

    /// Every JWS posted to `path`, oldest first.
    pub async fn requests_to(&self, path: &str) -> Vec<RecordedJws> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "POST" && r.url.path() == path)
            .map(|r| RecordedJws(serde_json::from_slice(&r.body).unwrap()))
            .collect()
    }

    /// Number of requests of any kind to paths other than the directory.
    pub async fn ca_interactions(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() != "/directory")
            .count()
    }

    pub async fn assert_directory_hits(&self, expected: usize) {
        let hits = self
            .server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/directory")
            .count();
        assert_eq!(hits, expected);
    }
}

/// Challenge resource body for `/chal/http`.
pub fn challenge_json(ca: &MockCa, status: &str) -> Value {
    json!({
        "type": "http-01",
        "url": ca.url("/chal/http"),
        "status": status,
        "token": "token-http"
    })
}

// ============================================================================
// Fake registries
// ============================================================================

/// Registry that records every call and mirrors upstream membership into
/// a service table.
pub struct RecordingRegistry {
    services: Arc<ServiceTable>,
    full: bool,
    calls: Mutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl RecordingRegistry {
    /// Offers every capability.
    pub fn full(services: Arc<ServiceTable>) -> Self {
        Self::with(services, true)
    }

    /// Offers no optional capability.
    pub fn bare(services: Arc<ServiceTable>) -> Self {
        Self::with(services, false)
    }

    fn with(services: Arc<ServiceTable>, full: bool) -> Self {
        Self {
            services,
            full,
            calls: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Reject the next mutating call.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn record(&self, service: &Service, call: String) -> Result<(), RegistryError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RegistryError::Rejected {
                service: service.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl Registry for RecordingRegistry {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn add_service(&self, service: &Service) -> Result<(), RegistryError> {
        self.record(service, format!("add_service:{}", service.name))?;
        self.services
            .add_upstream(&service.identifier(), &service.upstream)?;
        Ok(())
    }

    async fn remove_service(&self, service: &Service) -> Result<(), RegistryError> {
        self.record(service, format!("remove_service:{}", service.name))?;
        self.services
            .remove_upstream(&service.identifier(), &service.upstream)?;
        Ok(())
    }

    fn capabilities(self: Arc<Self>) -> Capabilities {
        if !self.full {
            return Capabilities::default();
        }
        Capabilities {
            upstreams: Some(self.clone()),
            reloader: Some(self.clone()),
            initializer: Some(self.clone()),
            http_challenge: Some(self),
        }
    }
}

#[async_trait]
impl UpstreamManager for RecordingRegistry {
    async fn add_upstream(&self, service: &Service) -> Result<(), RegistryError> {
        self.record(service, format!("add_upstream:{}", service.upstream))?;
        self.services
            .add_upstream(&service.identifier(), &service.upstream)?;
        Ok(())
    }

    async fn remove_upstream(&self, service: &Service) -> Result<(), RegistryError> {
        self.record(service, format!("remove_upstream:{}", service.upstream))?;
        self.services
            .remove_upstream(&service.identifier(), &service.upstream)?;
        Ok(())
    }
}

#[async_trait]
impl Reloadable for RecordingRegistry {
    async fn reload(&self) -> Result<(), RegistryError> {
        self.calls.lock().push("reload".to_string());
        Ok(())
    }
}

#[async_trait]
impl Initializer for RecordingRegistry {
    async fn init(&self) -> Result<(), RegistryError> {
        self.calls.lock().push("init".to_string());
        Ok(())
    }
}

#[async_trait]
impl HttpChallengeResponder for RecordingRegistry {
    async fn serve_http_challenge(
        &self,
        domain: &str,
        token: &str,
        _payload: &str,
    ) -> Result<(), RegistryError> {
        self.calls.lock().push(format!("serve:{}:{}", domain, token));
        Ok(())
    }

    async fn cleanup(&self, domain: &str) -> Result<(), RegistryError> {
        self.calls.lock().push(format!("cleanup:{}", domain));
        Ok(())
    }
}

/// Certificate requester that only records what it was asked for.
#[derive(Default)]
pub struct RecordingRequester {
    requests: Mutex<Vec<(AutoTls, String)>>,
}

impl RecordingRequester {
    pub fn requests(&self) -> Vec<(AutoTls, String)> {
        self.requests.lock().clone()
    }
}

impl CertificateRequester for RecordingRequester {
    fn request_certificate(&self, policy: AutoTls, domain: &str) {
        self.requests.lock().push((policy, domain.to_string()));
    }
}
