//! Upstream dispatch.
//!
//! A [`Forwarder`] owns one pooled `reqwest::Client` for the process. Each call
//! sanitizes the inbound headers, swaps the caller's credential for the
//! operator's upstream key and runs the retry loop: statuses below 500 are
//! returned as-is, 5xx and network failures are retried with capped
//! exponential backoff until the attempt budget is spent.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Inbound headers never forwarded upstream: hop-by-hop headers, the
/// caller's own credential headers, and `accept-encoding` (the client
/// negotiates compression itself so bodies arrive decoded).
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "authorization",
    "x-api-key",
    "accept-encoding",
];

/// Upstream headers never returned to the caller. The body is re-framed here,
/// so transfer length and encoding must not leak through.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "content-encoding",
    "content-length",
];

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Upstream base URL, e.g. `https://api.anthropic.com/v1`.
    pub base_url: String,
    /// Operator secret injected as `Authorization: Bearer …`.
    pub upstream_key: String,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Total attempts per call (at least one is always made).
    pub max_retries: u32,
    /// Backoff before retry `n` is `min(unit * 2^n, cap)`.
    pub backoff_unit: Duration,
    pub backoff_cap: Duration,
    /// Upper bound on concurrent upstream exchanges; excess calls queue.
    pub max_connections: usize,
    pub max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    /// Route every upstream exchange through this proxy.
    pub proxy_url: Option<String>,
    /// Ignore proxies from the environment (`HTTP_PROXY`, `HTTPS_PROXY`).
    pub no_proxy: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            upstream_key: String::new(),
            timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_connections: 100,
            max_idle_per_host: 20,
            pool_idle_timeout: Duration::from_secs(90),
            proxy_url: None,
            no_proxy: false,
        }
    }
}

/// `min(unit * 2^attempt, cap)`; `attempt` is 0-based.
pub fn backoff_delay(attempt: u32, unit: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    unit.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Client errors are not upstream instability and are never retried.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status.as_u16() >= 600
}

/// HTTP-shaped request handed to the forwarder.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path plus optional `?query`, appended to the upstream base URL.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
    pub scheme: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Number of attempts made, including the successful one.
    pub attempts: u32,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Headers safe to return to the caller.
    pub fn client_headers(&self) -> HeaderMap {
        filter_response_headers(&self.headers)
    }
}

/// Why an attempt is worth repeating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    Timeout(String),
    Network(String),
    ServerStatus(u16),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Timeout(msg) => write!(f, "timeout: {msg}"),
            RetryReason::Network(msg) => write!(f, "network error: {msg}"),
            RetryReason::ServerStatus(status) => write!(f, "upstream returned {status}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream timed out after {attempts} attempt(s): {message}")]
    Timeout { attempts: u32, message: String },
    #[error("upstream failed after {attempts} attempt(s): {message}")]
    Upstream {
        attempts: u32,
        status: Option<u16>,
        message: String,
    },
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
    #[error("forwarder is shut down")]
    Closed,
}

impl ForwardError {
    /// Ledger error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::Timeout { .. } => "TIMEOUT",
            ForwardError::Upstream { .. } => "UPSTREAM_ERROR",
            ForwardError::InvalidRequest(_) | ForwardError::Closed => "PROXY_ERROR",
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ForwardError::Timeout { attempts, .. } | ForwardError::Upstream { attempts, .. } => {
                *attempts
            }
            ForwardError::InvalidRequest(_) | ForwardError::Closed => 0,
        }
    }
}

/// Result of one upstream exchange.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(UpstreamResponse),
    Retryable(RetryReason),
    Terminal(ForwardError),
}

/// Next move of the retry loop.
#[derive(Debug)]
pub enum Step {
    Done(Result<UpstreamResponse, ForwardError>),
    Retry(Duration),
}

/// Per-call retry bookkeeping. Lives only inside [`Forwarder::forward`].
#[derive(Debug)]
pub struct RetryState {
    attempt: u32,
    max_attempts: u32,
    unit: Duration,
    cap: Duration,
    last: Option<RetryReason>,
    started: Instant,
}

impl RetryState {
    pub fn new(max_retries: u32, unit: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts: max_retries.max(1),
            unit,
            cap,
            last: None,
            started: Instant::now(),
        }
    }

    /// 0-based index of the attempt currently in flight.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn advance(&mut self, outcome: AttemptOutcome) -> Step {
        match outcome {
            AttemptOutcome::Success(mut response) => {
                response.attempts = self.attempt + 1;
                Step::Done(Ok(response))
            }
            AttemptOutcome::Terminal(err) => Step::Done(Err(err)),
            AttemptOutcome::Retryable(reason) => {
                self.last = Some(reason);
                if self.attempt + 1 >= self.max_attempts {
                    return Step::Done(Err(self.exhausted()));
                }
                let delay = backoff_delay(self.attempt, self.unit, self.cap);
                self.attempt += 1;
                Step::Retry(delay)
            }
        }
    }

    fn exhausted(&self) -> ForwardError {
        let attempts = self.attempt + 1;
        match &self.last {
            Some(RetryReason::Timeout(msg)) => ForwardError::Timeout {
                attempts,
                message: msg.clone(),
            },
            Some(RetryReason::ServerStatus(status)) => ForwardError::Upstream {
                attempts,
                status: Some(*status),
                message: format!("upstream returned {status}"),
            },
            Some(RetryReason::Network(msg)) => ForwardError::Upstream {
                attempts,
                status: None,
                message: msg.clone(),
            },
            None => ForwardError::Upstream {
                attempts,
                status: None,
                message: "no attempt succeeded".to_string(),
            },
        }
    }
}

/// Build the outbound header set from the caller's headers.
pub fn sanitize_request_headers(
    inbound: &HeaderMap,
    upstream_key: &str,
    client_ip: Option<&str>,
    scheme: &str,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 4);
    for (name, value) in inbound {
        if !STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }

    match HeaderValue::from_str(&format!("Bearer {upstream_key}")) {
        Ok(mut bearer) => {
            bearer.set_sensitive(true);
            out.insert(AUTHORIZATION, bearer);
        }
        Err(_) => warn!("upstream key is not a valid header value; sending without it"),
    }

    if let Some(ip) = client_ip.and_then(|ip| HeaderValue::from_str(ip).ok()) {
        out.insert(HeaderName::from_static("x-forwarded-for"), ip.clone());
        out.insert(HeaderName::from_static("x-real-ip"), ip);
    }
    if let Ok(proto) = HeaderValue::from_str(scheme) {
        out.insert(HeaderName::from_static("x-forwarded-proto"), proto);
    }
    out
}

pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub struct Forwarder {
    client: Client,
    config: ForwarderConfig,
    permits: Semaphore,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .user_agent(format!("relaygate/{}", env!("CARGO_PKG_VERSION")));
        if config.no_proxy {
            builder = builder.no_proxy();
        } else if let Some(url) = config.proxy_url.as_deref().filter(|u| !u.trim().is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(url.trim())?);
        }
        let client = builder.build()?;
        info!(
            base_url = %config.base_url,
            max_connections = config.max_connections,
            max_retries = config.max_retries,
            timeout_secs = config.timeout.as_secs_f64(),
            "upstream forwarder ready"
        );
        Ok(Self {
            client,
            permits: Semaphore::new(config.max_connections.max(1)),
            config,
        })
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Stop accepting calls. In-flight exchanges finish; new ones fail with
    /// [`ForwardError::Closed`].
    pub fn shutdown(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            info!("upstream forwarder shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn target_url(&self, path_and_query: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if path_and_query.starts_with('/') {
            format!("{base}{path_and_query}")
        } else {
            format!("{base}/{path_and_query}")
        }
    }

    pub async fn forward(&self, req: &OutboundRequest) -> Result<UpstreamResponse, ForwardError> {
        if self.is_closed() {
            return Err(ForwardError::Closed);
        }
        let url = self.target_url(&req.path_and_query);
        let headers = sanitize_request_headers(
            &req.headers,
            &self.config.upstream_key,
            req.client_ip.as_deref(),
            &req.scheme,
        );
        let mut state = RetryState::new(
            self.config.max_retries,
            self.config.backoff_unit,
            self.config.backoff_cap,
        );

        loop {
            let outcome = self
                .attempt(&req.method, &url, &headers, req.body.clone())
                .await;
            if let AttemptOutcome::Retryable(reason) = &outcome {
                warn!(
                    attempt = state.attempt() + 1,
                    method = %req.method,
                    reason = %reason,
                    "upstream attempt failed"
                );
            }
            match state.advance(outcome) {
                Step::Done(result) => {
                    debug!(
                        elapsed_ms = state.elapsed().as_millis() as u64,
                        ok = result.is_ok(),
                        "forward finished"
                    );
                    return result;
                }
                Step::Retry(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> AttemptOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return AttemptOutcome::Terminal(ForwardError::Closed),
        };

        let sent = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .body(body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(err) => return classify_transport_error(err),
        };

        let status = response.status();
        if is_retryable_status(status) {
            return AttemptOutcome::Retryable(RetryReason::ServerStatus(status.as_u16()));
        }

        let headers = response.headers().clone();
        match response.bytes().await {
            Ok(body) => AttemptOutcome::Success(UpstreamResponse {
                status,
                headers,
                body,
                attempts: 1,
            }),
            Err(err) => classify_transport_error(err),
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> AttemptOutcome {
    if err.is_timeout() {
        AttemptOutcome::Retryable(RetryReason::Timeout(err.to_string()))
    } else if err.is_builder() {
        AttemptOutcome::Terminal(ForwardError::InvalidRequest(err.to_string()))
    } else {
        AttemptOutcome::Retryable(RetryReason::Network(err.to_string()))
    }
}
