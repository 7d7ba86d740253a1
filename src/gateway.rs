//! Per-call orchestration: gate, forward, parse usage, record.
//!
//! Every call that passes the gate ends with exactly one ledger entry. The
//! entry is written from a spawned task so a caller that disconnects while
//! the recorder is running cannot interrupt it, and a [`PendingAttempt`]
//! guard covers the case where the caller goes away before the upstream
//! answered.

use bytes::Bytes;
use http::header::USER_AGENT;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::forwarder::{ForwardError, Forwarder, OutboundRequest};
use crate::gate::{extract_secret, request_origin, Denial, Gate, GateError};
use crate::credential::Credential;
use crate::ledger::{LedgerEntry, LedgerQuery, LedgerStore};
use crate::recorder::{AttemptInfo, Outcome, UsageRecorder};
use crate::tokens::TokenEstimator;
use crate::usage::{extract_usage, UsageSnapshot};

/// Routes served by the gateway. Matched exactly, so `/` is covered by `""`.
const GATEWAY_PATHS: &[&str] = &[
    "",
    "health",
    "status",
    "metrics",
    "api",
    "api/usage",
    "api/usage/logs",
    "api/usage/quota",
    "api/usage/daily",
];

/// HTTP-shaped request as seen by the boundary.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Path relative to the upstream base, with a leading `/`.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
    pub scheme: String,
}

impl InboundRequest {
    pub fn path_and_query(&self) -> String {
        match self.query.as_deref().filter(|q| !q.is_empty()) {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    /// Already filtered for the caller.
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Caller-facing error taxonomy. Messages are generic on purpose; details
/// stay in the logs and the ledger.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Denied(Denial),
    #[error("Upstream API timeout")]
    UpstreamTimeout,
    #[error("Upstream API error")]
    UpstreamFailure,
    #[error("Proxy error")]
    ProxyFailure,
    #[error("Not found")]
    NotFound,
    #[error("{0}")]
    InvalidQuery(&'static str),
    #[error("Internal server error")]
    Internal,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Denied(denial) => denial.status_code(),
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamFailure | GatewayError::ProxyFailure => StatusCode::BAD_GATEWAY,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Denied(denial) => denial.kind(),
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::UpstreamFailure => "upstream_error",
            GatewayError::ProxyFailure => "proxy_error",
            GatewayError::NotFound => "not_found",
            GatewayError::InvalidQuery(_) => "invalid_request_error",
            GatewayError::Internal => "internal_error",
        }
    }
}

impl From<GateError> for GatewayError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Denied(denial) => GatewayError::Denied(denial),
            GateError::Lookup(store_err) => {
                error!(error = %store_err, "credential lookup failed");
                GatewayError::Internal
            }
        }
    }
}

impl From<&ForwardError> for GatewayError {
    fn from(err: &ForwardError) -> Self {
        match err {
            ForwardError::Timeout { .. } => GatewayError::UpstreamTimeout,
            ForwardError::Upstream { .. } => GatewayError::UpstreamFailure,
            ForwardError::InvalidRequest(_) | ForwardError::Closed => GatewayError::ProxyFailure,
        }
    }
}

/// Armed once a call is admitted. Either [`PendingAttempt::commit`] records
/// the real outcome, or dropping the guard records a `CLIENT_CLOSED` entry.
pub struct PendingAttempt {
    recorder: UsageRecorder,
    credential_id: String,
    attempt: Option<AttemptInfo>,
}

impl PendingAttempt {
    pub fn arm(recorder: UsageRecorder, credential_id: String, attempt: AttemptInfo) -> Self {
        Self {
            recorder,
            credential_id,
            attempt: Some(attempt),
        }
    }

    pub async fn commit(mut self, usage: UsageSnapshot, outcome: Outcome) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        let recorder = self.recorder.clone();
        let credential_id = self.credential_id.clone();
        let request_id = attempt.request_id.clone();
        let task = tokio::spawn(async move {
            recorder
                .record(&credential_id, &attempt, &usage, &outcome)
                .await;
        });
        if let Err(err) = task.await {
            error!(request_id = %request_id, error = %err, "usage recording task failed");
        }
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        warn!(
            request_id = %attempt.request_id,
            credential_id = %self.credential_id,
            "client went away before the upstream answered"
        );
        let recorder = self.recorder.clone();
        let credential_id = std::mem::take(&mut self.credential_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    recorder
                        .record(
                            &credential_id,
                            &attempt,
                            &UsageSnapshot::default(),
                            &Outcome::Cancelled,
                        )
                        .await;
                });
            }
            Err(_) => error!(
                request_id = %attempt.request_id,
                "no runtime available to record cancelled call"
            ),
        }
    }
}

pub struct Gateway {
    gate: Gate,
    forwarder: Arc<Forwarder>,
    recorder: UsageRecorder,
    estimator: TokenEstimator,
    reserved_prefixes: Vec<String>,
}

impl Gateway {
    pub fn new(
        gate: Gate,
        forwarder: Arc<Forwarder>,
        recorder: UsageRecorder,
        estimator: TokenEstimator,
        reserved_prefixes: Vec<String>,
    ) -> Self {
        Self {
            gate,
            forwarder,
            recorder,
            estimator,
            reserved_prefixes,
        }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Paths owned by the gateway itself are never proxied, whatever the
    /// method: the fixed gateway routes plus the configured prefixes.
    pub fn is_reserved(&self, path: &str) -> bool {
        let trimmed = path.trim_start_matches('/');
        if GATEWAY_PATHS.contains(&trimmed.trim_end_matches('/')) {
            return true;
        }
        self.reserved_prefixes
            .iter()
            .map(|prefix| prefix.trim_start_matches('/'))
            .filter(|prefix| !prefix.is_empty())
            .any(|prefix| trimmed.starts_with(prefix))
    }

    /// Ledger entries for one credential, newest first.
    pub async fn usage_entries(
        &self,
        credential_id: &str,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>, GatewayError> {
        self.recorder
            .ledger()
            .query(credential_id, query)
            .await
            .map_err(|err| {
                error!(credential_id, error = %err, "ledger query failed");
                GatewayError::Internal
            })
    }

    /// Resolve the caller without enforcing quota; used by the usage endpoints.
    pub async fn inspect(
        &self,
        headers: &HeaderMap,
        client_ip: Option<&str>,
    ) -> Result<Credential, GatewayError> {
        let secret = extract_secret(headers);
        let origin = request_origin(headers);
        Ok(self
            .gate
            .inspect(secret.as_deref(), client_ip, origin.as_deref())
            .await?)
    }

    async fn authorize(
        &self,
        headers: &HeaderMap,
        client_ip: Option<&str>,
    ) -> Result<Credential, GatewayError> {
        let secret = extract_secret(headers);
        let origin = request_origin(headers);
        Ok(self
            .gate
            .admit(secret.as_deref(), client_ip, origin.as_deref())
            .await?)
    }

    pub async fn handle(
        &self,
        request_id: &str,
        req: InboundRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if self.is_reserved(&req.path) {
            debug!(path = %req.path, "reserved path, not forwarding");
            return Err(GatewayError::NotFound);
        }

        let cred = self.authorize(&req.headers, req.client_ip.as_deref()).await?;

        let attempt = AttemptInfo {
            request_id: request_id.to_string(),
            method: req.method.to_string(),
            path: req.path.clone(),
            request_bytes: req.body.len() as u64,
            client_ip: req.client_ip.clone(),
            origin: request_origin(&req.headers),
            user_agent: req.header_str(USER_AGENT),
            started: Instant::now(),
        };
        let pending = PendingAttempt::arm(self.recorder.clone(), cred.id.clone(), attempt);

        let outbound = OutboundRequest {
            method: req.method.clone(),
            path_and_query: req.path_and_query(),
            headers: req.headers.clone(),
            body: req.body.clone(),
            client_ip: req.client_ip.clone(),
            scheme: req.scheme.clone(),
        };

        match self.forwarder.forward(&outbound).await {
            Ok(resp) => {
                let usage = extract_usage(resp.content_type(), &req.body, &resp.body, &self.estimator);
                let outcome = Outcome::Completed {
                    status: resp.status.as_u16(),
                    response_bytes: resp.body.len() as u64,
                    attempts: resp.attempts,
                };
                pending.commit(usage, outcome).await;
                Ok(GatewayResponse {
                    status: resp.status,
                    headers: resp.client_headers(),
                    body: resp.body,
                })
            }
            Err(err) => {
                warn!(
                    request_id,
                    credential_id = %cred.id,
                    code = err.code(),
                    error = %err,
                    "forward failed"
                );
                pending
                    .commit(UsageSnapshot::default(), Outcome::from_error(&err))
                    .await;
                Err(GatewayError::from(&err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialStore, MemoryCredentialStore};
    use crate::forwarder::ForwarderConfig;
    use crate::ledger::{LedgerStore, MemoryLedgerStore};
    use crate::pricing::PricingTable;
    use http::HeaderValue;
    use std::time::Duration;

    fn gateway(
        creds: Arc<MemoryCredentialStore>,
        ledger: Arc<MemoryLedgerStore>,
    ) -> Gateway {
        let forwarder = Forwarder::new(ForwarderConfig {
            // Nothing listens here; tests below must never reach it.
            base_url: "http://127.0.0.1:9".into(),
            max_retries: 1,
            timeout: Duration::from_millis(200),
            ..ForwarderConfig::default()
        })
        .unwrap();
        let recorder = UsageRecorder::new(creds.clone(), ledger, Arc::new(PricingTable::default()));
        Gateway::new(
            Gate::new(creds),
            Arc::new(forwarder),
            recorder,
            TokenEstimator::default(),
            vec!["admin/".into(), "dashboard".into(), "user-login".into()],
        )
    }

    fn request(path: &str, secret: Option<&'static str>) -> InboundRequest {
        let mut headers = HeaderMap::new();
        if let Some(secret) = secret {
            headers.insert("x-api-key", HeaderValue::from_static(secret));
        }
        InboundRequest {
            method: Method::POST,
            path: path.to_string(),
            query: None,
            headers,
            body: Bytes::from_static(b"{}"),
            client_ip: Some("127.0.0.1".into()),
            scheme: "http".into(),
        }
    }

    async fn wait_for_entries(ledger: &MemoryLedgerStore, n: usize) {
        for _ in 0..100 {
            if ledger.len().await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn path_and_query_join() {
        let mut req = request("/messages", None);
        assert_eq!(req.path_and_query(), "/messages");
        req.query = Some("beta=true".into());
        assert_eq!(req.path_and_query(), "/messages?beta=true");
    }

    #[tokio::test]
    async fn reserved_paths_are_not_found() {
        let gw = gateway(Arc::new(MemoryCredentialStore::new()), Arc::new(MemoryLedgerStore::new()));
        assert!(gw.is_reserved("/admin/keys"));
        assert!(gw.is_reserved("/dashboard"));
        assert!(gw.is_reserved("/user-login/reset"));
        assert!(gw.is_reserved("/"));
        assert!(gw.is_reserved("/health"));
        assert!(gw.is_reserved("/api/usage/logs/"));
        assert!(!gw.is_reserved("/messages"));
        assert!(!gw.is_reserved("/api/other"));
        assert!(!gw.is_reserved("/healthz"));
        let err = gw.handle("r1", request("/api/usage", Some("k"))).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn denial_writes_nothing() {
        let creds = Arc::new(MemoryCredentialStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let mut cred = Credential::new("off", "sk-off", 100);
        cred.is_active = false;
        creds.insert(&cred).await.unwrap();
        let gw = gateway(creds.clone(), ledger.clone());

        let err = gw.handle("r2", request("/messages", Some("sk-off"))).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        let err = gw.handle("r3", request("/messages", None)).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert!(ledger.is_empty().await);
    }

    #[tokio::test]
    async fn dropped_guard_records_client_closed() {
        let creds = Arc::new(MemoryCredentialStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let cred = Credential::new("c", "sk-c", 100);
        creds.insert(&cred).await.unwrap();
        let recorder = UsageRecorder::new(creds.clone(), ledger.clone(), Arc::new(PricingTable::default()));

        let attempt = AttemptInfo {
            request_id: "gone".into(),
            method: "POST".into(),
            path: "/messages".into(),
            request_bytes: 2,
            client_ip: None,
            origin: None,
            user_agent: None,
            started: Instant::now(),
        };
        drop(PendingAttempt::arm(recorder, cred.id.clone(), attempt));
        wait_for_entries(&ledger, 1).await;

        let entries = ledger.list_for_credential(&cred.id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_code.as_deref(), Some("CLIENT_CLOSED"));
        assert_eq!(entries[0].status_code, 499);
        let after = creds.find_by_id(&cred.id).await.unwrap().unwrap();
        assert_eq!(after.error_count, 0);
        assert_eq!(after.token_used, 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_recorded_once() {
        let creds = Arc::new(MemoryCredentialStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let cred = Credential::new("c", "sk-c", 100);
        creds.insert(&cred).await.unwrap();
        let gw = gateway(creds.clone(), ledger.clone());

        let err = gw.handle("r4", request("/messages", Some("sk-c"))).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::UpstreamFailure | GatewayError::UpstreamTimeout
        ));
        let entries = ledger.list_for_credential(&cred.id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_error);
        let after = creds.find_by_id(&cred.id).await.unwrap().unwrap();
        assert_eq!(after.error_count, 1);
    }
}
