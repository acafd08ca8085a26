//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, attaches a pooled
//! key as `Authorization: Bearer <key>` and forwards to the upstream URL.
//! Upstream responses are relayed verbatim, except 429: the key is penalized
//! and the request retried with another key after a backoff.

use crate::error::Error;
use crate::metrics::{self, ServiceMetrics};
use axum::body::{Body, Bytes};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, RETRY_AFTER};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use common::ApiKey;
use key_pool::{Orchestrator, Outcome, OutcomeKind, classify_status, parse_retry_after};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    /// Per-attempt upstream timeout. Also bounds how long a request may wait
    /// for a key or back off between attempts.
    pub timeout: Duration,
    pub orchestrator: Orchestrator,
    pub metrics: ServiceMetrics,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(err: &Error, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": err.error_type(),
            "message": err.to_string(),
            "request_id": request_id,
        }
    });
    (
        err.status(),
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Decrements the in-flight gauge however the handler exits.
struct InFlight<'a>(&'a ServiceMetrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a ServiceMetrics) -> Self {
        metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy an inbound request upstream through the key pool.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.metrics);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();

    let response = match relay(state, request).await {
        Ok(response) => response,
        Err(err) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            if let Some(label) = err.upstream_label() {
                metrics::record_upstream_error(label);
            }
            match err {
                Error::Upstream(_) | Error::UpstreamTimeout { .. } => {
                    error!(error = %err, "upstream request failed")
                }
                _ => warn!(error = %err, "request not relayed"),
            }
            error_response(&err, &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn relay(state: &ProxyState, request: axum::http::Request<Body>) -> Result<Response, Error> {
    let method = request.method().clone();

    // Build the upstream URL by appending the request path and query
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };
    let headers = forward_headers(request.headers());

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;

    let timeout_secs = state.timeout.as_secs();
    let deadline = tokio::time::sleep(state.timeout);

    state
        .orchestrator
        .execute_with_cancel(
            |key: ApiKey| {
                let attempt = build_attempt(state, &method, &upstream_url, &headers, &body, &key);
                async move { send_attempt(attempt, timeout_secs).await }
            },
            deadline,
        )
        .await
        .map_err(|e| Error::from_execute(e, state.timeout))
}

fn build_attempt(
    state: &ProxyState,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    body: &Bytes,
    key: &ApiKey,
) -> reqwest::RequestBuilder {
    debug!(key = %key, "sending upstream attempt");
    state
        .client
        .request(method.clone(), url)
        .headers(headers.clone())
        .bearer_auth(key.expose())
        .timeout(state.timeout)
        .body(body.clone())
}

/// One upstream round trip, classified for the orchestrator.
async fn send_attempt(
    request: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Outcome<Response, Error> {
    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(e) if e.is_timeout() => return Outcome::Failed(Error::UpstreamTimeout { timeout_secs }),
        Err(e) => return Outcome::Failed(Error::Upstream(e.to_string())),
    };

    let status = upstream.status();
    if classify_status(status.as_u16()) == OutcomeKind::RateLimited {
        let retry_after = upstream
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Outcome::RateLimited { retry_after };
    }

    let resp_headers = upstream.headers().clone();
    let resp_body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return Outcome::Failed(Error::Upstream(format!("response read error: {e}")));
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &resp_headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    match response.body(Body::from(resp_body)) {
        Ok(response) => Outcome::Success(response),
        Err(e) => Outcome::Failed(Error::Upstream(format!("response build error: {e}"))),
    }
}

/// Client headers minus hop-by-hop ones. `Host` is set by the client from the
/// upstream URL and `Authorization` is replaced by the pooled key.
fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        if is_hop_by_hop(name.as_str()) || name == HOST || name == AUTHORIZATION {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
