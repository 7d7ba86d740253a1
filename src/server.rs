use actix_web::http::header::{HeaderName as ActixHeaderName, HeaderValue as ActixHeaderValue};
use actix_web::http::{Method as ActixMethod, StatusCode as ActixStatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ConfigError, GatewayConfig};
use crate::credential::{open_credential_store, Credential, StoreError};
use crate::forwarder::Forwarder;
use crate::gate::Gate;
use crate::gateway::{Gateway, GatewayError, InboundRequest};
use crate::ledger::{open_ledger_store, LedgerQuery};
use crate::recorder::UsageRecorder;
use crate::stats::{daily_usage, parse_timestamp, UsageStatistics, SECONDS_PER_DAY};
use crate::tokens::TokenEstimator;
use crate::util::{error_response, now_epoch};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Methods the proxy catch-all accepts.
const PROXIED_METHODS: &[ActixMethod] = &[
    ActixMethod::GET,
    ActixMethod::POST,
    ActixMethod::PUT,
    ActixMethod::DELETE,
    ActixMethod::PATCH,
    ActixMethod::HEAD,
    ActixMethod::OPTIONS,
];

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Open the stores and build the forwarder described by `config`.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self, StartupError> {
        let credentials = open_credential_store(&config.credential_backend()?).await?;
        let ledger = open_ledger_store(&config.ledger_backend()?).await?;
        let forwarder = Arc::new(Forwarder::new(config.forwarder_config())?);
        let recorder = UsageRecorder::new(
            credentials.clone(),
            ledger,
            Arc::new(config.pricing_table()),
        );
        let gateway = Gateway::new(
            Gate::new(credentials),
            forwarder,
            recorder,
            TokenEstimator::new(config.gateway.token_estimation),
            config.gateway.reserved_prefixes.clone(),
        );
        Ok(Self::new(Arc::new(gateway)))
    }

    pub fn forwarder(&self) -> &Forwarder {
        self.gateway.forwarder()
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> ActixStatusCode {
        to_actix_status(GatewayError::status_code(self))
    }

    fn error_response(&self) -> HttpResponse {
        error_response(ResponseError::status_code(self), self.kind(), &self.to_string())
    }
}

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(status))
        .route("/api/usage", web::get().to(usage_statistics))
        .route("/api/usage/logs", web::get().to(usage_logs))
        .route("/api/usage/daily", web::get().to(usage_daily))
        .route("/api/usage/quota", web::get().to(quota))
        .default_service(web::to(proxy));
}

async fn health() -> impl Responder {
    web::Json(serde_json::json!({ "status": "healthy" }))
}

/// Service status: version and upstream settings, never the upstream key.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let fwd = state.forwarder().config();
    web::Json(serde_json::json!({
        "name": "relaygate",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": {
            "base_url": fwd.base_url,
            "timeout_seconds": fwd.timeout.as_secs_f64(),
            "max_retries": fwd.max_retries,
            "max_connections": fwd.max_connections,
        },
        "accepting": !state.forwarder().is_closed(),
        "routes": [
            "/health",
            "/status",
            "/api/usage",
            "/api/usage/logs",
            "/api/usage/daily",
            "/api/usage/quota",
            "/*"
        ],
    }))
}

/// Query string shared by the usage endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UsageParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    pub days: Option<u32>,
}

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;
const DEFAULT_DAYS: u32 = 30;
const MAX_DAYS: u32 = 365;

impl UsageParams {
    fn window(&self) -> Result<LedgerQuery, GatewayError> {
        let bound = |raw: &Option<String>, what: &'static str| match raw.as_deref() {
            None => Ok(None),
            Some(raw) => parse_timestamp(raw)
                .map(Some)
                .ok_or(GatewayError::InvalidQuery(what)),
        };
        Ok(LedgerQuery::between(
            bound(&self.start_date, "start_date is not a valid date")?,
            bound(&self.end_date, "end_date is not a valid date")?,
        ))
    }

    fn page(&self) -> Result<LedgerQuery, GatewayError> {
        let limit = self.limit.unwrap_or(DEFAULT_LOG_LIMIT);
        if !(1..=MAX_LOG_LIMIT).contains(&limit) {
            return Err(GatewayError::InvalidQuery("limit must be between 1 and 1000"));
        }
        Ok(LedgerQuery {
            skip: self.skip.unwrap_or(0),
            limit: Some(limit),
            ..self.window()?
        })
    }

    fn days(&self) -> Result<u32, GatewayError> {
        let days = self.days.unwrap_or(DEFAULT_DAYS);
        if !(1..=MAX_DAYS).contains(&days) {
            return Err(GatewayError::InvalidQuery("days must be between 1 and 365"));
        }
        Ok(days)
    }
}

/// Resolve the calling credential for the read-only usage endpoints.
async fn caller(state: &AppState, req: &HttpRequest) -> Result<Credential, GatewayError> {
    let headers = to_http_headers(req.headers());
    let client_ip = peer_ip(req);
    state.gateway.inspect(&headers, client_ip.as_deref()).await
}

async fn usage_statistics(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<UsageParams>,
) -> Result<HttpResponse, GatewayError> {
    let cred = caller(&state, &req).await?;
    let window = params.window()?;
    let entries = state.gateway.usage_entries(&cred.id, &window).await?;
    info!(
        credential_id = %cred.id,
        since = ?window.since,
        until = ?window.until,
        entries = entries.len(),
        "usage statistics retrieved"
    );
    Ok(HttpResponse::Ok().json(UsageStatistics::from_entries(&entries)))
}

async fn usage_logs(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<UsageParams>,
) -> Result<HttpResponse, GatewayError> {
    let cred = caller(&state, &req).await?;
    let page = params.page()?;
    let entries = state.gateway.usage_entries(&cred.id, &page).await?;
    info!(credential_id = %cred.id, count = entries.len(), "usage logs retrieved");
    Ok(HttpResponse::Ok().json(entries))
}

async fn usage_daily(
    state: web::Data<AppState>,
    req: HttpRequest,
    params: web::Query<UsageParams>,
) -> Result<HttpResponse, GatewayError> {
    let cred = caller(&state, &req).await?;
    let days = params.days()?;
    let since = now_epoch().saturating_sub(u64::from(days) * SECONDS_PER_DAY);
    let entries = state
        .gateway
        .usage_entries(&cred.id, &LedgerQuery::between(Some(since), None))
        .await?;
    info!(credential_id = %cred.id, days, "daily usage retrieved");
    Ok(HttpResponse::Ok().json(daily_usage(&entries)))
}

async fn quota(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, GatewayError> {
    let cred = caller(&state, &req).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "token_limit": cred.token_limit,
        "token_used": cred.token_used,
        "token_remaining": cred.token_remaining(),
        "usage_percentage": cred.usage_percentage(),
        "is_quota_exceeded": cred.token_used >= cred.token_limit,
        "request_count": cred.request_count,
        "is_active": cred.is_active,
        "expires_at": cred.expires_at,
        "is_expired": cred.is_expired(now_epoch()),
    })))
}

async fn proxy(state: web::Data<AppState>, req: HttpRequest, body: Bytes) -> HttpResponse {
    let request_id = Uuid::new_v4().to_string();

    if !PROXIED_METHODS.contains(req.method()) {
        return with_request_id(
            error_response(
                ActixStatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "Method not allowed",
            ),
            &request_id,
        );
    }

    let Ok(method) = http::Method::from_bytes(req.method().as_str().as_bytes()) else {
        return with_request_id(GatewayError::ProxyFailure.error_response(), &request_id);
    };

    let inbound = InboundRequest {
        method,
        path: req.path().to_string(),
        query: Some(req.query_string().to_string()).filter(|q| !q.is_empty()),
        headers: to_http_headers(req.headers()),
        body,
        client_ip: peer_ip(&req),
        scheme: req.connection_info().scheme().to_string(),
    };
    debug!(request_id = %request_id, method = %inbound.method, path = %inbound.path, "proxying");

    match state.gateway.handle(&request_id, inbound).await {
        Ok(resp) => {
            let mut builder = HttpResponse::build(to_actix_status(resp.status));
            for (name, value) in resp.headers.iter() {
                if let (Ok(n), Ok(v)) = (
                    ActixHeaderName::from_bytes(name.as_str().as_bytes()),
                    ActixHeaderValue::from_bytes(value.as_bytes()),
                ) {
                    builder.append_header((n, v));
                }
            }
            builder.insert_header((REQUEST_ID_HEADER, request_id.as_str()));
            builder.body(resp.body)
        }
        Err(err) => {
            info!(request_id = %request_id, status = err.status_code().as_u16(), kind = err.kind(), "request rejected");
            with_request_id(err.error_response(), &request_id)
        }
    }
}

fn with_request_id(mut resp: HttpResponse, request_id: &str) -> HttpResponse {
    if let Ok(value) = ActixHeaderValue::from_str(request_id) {
        resp.headers_mut()
            .insert(ActixHeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    resp
}

fn peer_ip(req: &HttpRequest) -> Option<String> {
    req.peer_addr().map(|addr| addr.ip().to_string())
}

fn to_actix_status(status: http::StatusCode) -> ActixStatusCode {
    ActixStatusCode::from_u16(status.as_u16()).unwrap_or(ActixStatusCode::BAD_GATEWAY)
}

/// actix-web and reqwest sit on different `http` major versions; headers
/// cross over by bytes.
fn to_http_headers(src: &actix_web::http::header::HeaderMap) -> http::HeaderMap {
    let mut out = http::HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        if let (Ok(n), Ok(v)) = (
            http::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            http::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(n, v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn header_conversion_keeps_repeated_values() {
        let req = TestRequest::default()
            .insert_header(("x-api-key", "sk-a"))
            .append_header(("accept", "application/json"))
            .append_header(("accept", "text/event-stream"))
            .to_http_request();
        let headers = to_http_headers(req.headers());
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-a");
        assert_eq!(headers.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn usage_params_validate_ranges() {
        let params = UsageParams::default();
        let page = params.page().unwrap();
        assert_eq!(page.limit, Some(100));
        assert_eq!(page.skip, 0);
        assert_eq!(params.days().unwrap(), 30);

        let params = UsageParams {
            start_date: Some("2024-03-01".into()),
            end_date: Some("1709337600".into()),
            skip: Some(5),
            limit: Some(1000),
            days: Some(365),
        };
        let page = params.page().unwrap();
        assert_eq!(page.since, Some(1_709_251_200));
        assert_eq!(page.until, Some(1_709_337_600));
        assert_eq!(page.skip, 5);
        assert_eq!(params.days().unwrap(), 365);

        for bad in [
            UsageParams { limit: Some(0), ..UsageParams::default() },
            UsageParams { limit: Some(1001), ..UsageParams::default() },
            UsageParams { start_date: Some("soon".into()), ..UsageParams::default() },
        ] {
            assert!(matches!(bad.page(), Err(GatewayError::InvalidQuery(_))));
        }
        assert!(UsageParams { days: Some(0), ..UsageParams::default() }.days().is_err());
        assert!(UsageParams { days: Some(366), ..UsageParams::default() }.days().is_err());
    }

    #[test]
    fn gateway_errors_map_to_status_codes() {
        use crate::gate::Denial;
        let cases = [
            (GatewayError::Denied(Denial::CredentialInvalid), 401),
            (GatewayError::Denied(Denial::CredentialDisabled { deleted: false }), 403),
            (GatewayError::Denied(Denial::QuotaExceeded { limit: 1, used: 1 }), 429),
            (GatewayError::Denied(Denial::IpNotAllowed), 403),
            (GatewayError::UpstreamTimeout, 504),
            (GatewayError::UpstreamFailure, 502),
            (GatewayError::ProxyFailure, 502),
            (GatewayError::NotFound, 404),
            (GatewayError::InvalidQuery("bad"), 400),
            (GatewayError::Internal, 500),
        ];
        for (err, code) in cases {
            assert_eq!(ResponseError::status_code(&err).as_u16(), code, "{err:?}");
        }
    }
}
