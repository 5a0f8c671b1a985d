//! HTTP-01 challenge responder
//!
//! Plain HTTP/1 server answering `GET /.well-known/acme-challenge/{token}`
//! from a [`ChallengeManager`]. The response is looked up by the request's
//! `Host` and the token. Anything else gets a 404, and methods other than
//! GET (or HEAD) on a challenge path get a 405.

use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

use crate::acme::ChallengeManager;

/// Serves published challenge responses
pub struct ChallengeResponder {
    listener: TcpListener,
    challenges: ChallengeManager,
}

impl ChallengeResponder {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr, challenges: ChallengeManager) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "ACME challenge responder listening");
        Ok(Self {
            listener,
            challenges,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("ACME challenge responder stopped");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let challenges = self.challenges.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<hyper::body::Incoming>| {
                let response = route(
                    request.method(),
                    request_host(&request),
                    request.uri().path(),
                    &challenges,
                );
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "Challenge connection ended with error");
            }
        });
    }
}

impl std::fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponder")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

/// `Host` header, or the authority of an absolute-form request target.
fn request_host<B>(request: &Request<B>) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
}

/// Answer one request.
pub fn route(
    method: &Method,
    host: Option<&str>,
    path: &str,
    challenges: &ChallengeManager,
) -> Response<Full<Bytes>> {
    let Some(token) = ChallengeManager::extract_token(path) else {
        return respond(StatusCode::NOT_FOUND, Bytes::new());
    };

    if method != Method::GET && method != Method::HEAD {
        let mut response = respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new());
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let Some(host) = host else {
        debug!(token = %token, "ACME challenge request without Host");
        return respond(StatusCode::NOT_FOUND, Bytes::new());
    };

    match challenges.get_response(host, token) {
        Some(key_authorization) => {
            trace!(host = %host, token = %token, "Served ACME challenge");
            respond(StatusCode::OK, Bytes::from(key_authorization))
        }
        None => {
            debug!(host = %host, token = %token, "Unknown ACME challenge token");
            respond(StatusCode::NOT_FOUND, Bytes::new())
        }
    }
}

fn respond(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
