//! Admission control.
//!
//! The gate resolves the caller's credential from the hash of its secret and
//! applies the activation, expiry, quota, IP and origin rules before any
//! upstream traffic happens. It never writes: denials leave no ledger entry
//! and touch no counter.
//!
//! # Quota consistency
//!
//! Enforcement is relaxed. The check here (`token_used >= token_limit`) and
//! the recorder's increment after the call are independent operations, so
//! concurrent in-flight calls on one credential can together overshoot the
//! limit by up to one response each. The increment itself is atomic, so no
//! usage is ever lost. Strict enforcement would require a conditional
//! increment in the store and is not done.

use http::header::{HeaderMap, AUTHORIZATION, ORIGIN};
use http::StatusCode;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

use crate::credential::{hash_secret, key_prefix, Credential, CredentialStore, StoreError};
use crate::util::{log_store_latency, now_epoch};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("invalid or missing API key")]
    CredentialInvalid,
    #[error("API key is disabled")]
    CredentialDisabled { deleted: bool },
    #[error("API key has expired")]
    CredentialExpired,
    #[error("token quota exceeded")]
    QuotaExceeded { limit: u64, used: u64 },
    #[error("client address not allowed for this API key")]
    IpNotAllowed,
    #[error("request origin not allowed for this API key")]
    OriginNotAllowed,
}

impl Denial {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Denial::CredentialInvalid | Denial::CredentialExpired => StatusCode::UNAUTHORIZED,
            Denial::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Denial::CredentialDisabled { .. } | Denial::IpNotAllowed | Denial::OriginNotAllowed => {
                StatusCode::FORBIDDEN
            }
        }
    }

    /// Stable machine-readable reason.
    pub fn kind(&self) -> &'static str {
        match self {
            Denial::CredentialInvalid => "credential_invalid",
            Denial::CredentialDisabled { .. } => "credential_disabled",
            Denial::CredentialExpired => "credential_expired",
            Denial::QuotaExceeded { .. } => "quota_exceeded",
            Denial::IpNotAllowed => "ip_not_allowed",
            Denial::OriginNotAllowed => "origin_not_allowed",
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Denied(#[from] Denial),
    #[error("credential lookup failed: {0}")]
    Lookup(#[from] StoreError),
}

/// Caller secret from `Authorization: Bearer …`, falling back to `X-API-Key`.
pub fn extract_secret(headers: &HeaderMap) -> Option<String> {
    if let Some(raw) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let raw = raw.trim();
        let is_bearer = raw
            .get(..7)
            .map(|scheme| scheme.eq_ignore_ascii_case("bearer "))
            .unwrap_or(false);
        if is_bearer {
            let token = raw[7..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn request_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Policy checks on a resolved credential, in denial-precedence order.
pub fn check_policy(
    cred: &Credential,
    now: u64,
    client_ip: Option<&str>,
    origin: Option<&str>,
) -> Result<(), Denial> {
    check_standing(cred, now)?;
    check_quota(cred)?;
    check_network(cred, client_ip, origin)
}

fn check_standing(cred: &Credential, now: u64) -> Result<(), Denial> {
    if cred.is_deleted {
        return Err(Denial::CredentialDisabled { deleted: true });
    }
    if !cred.is_active {
        return Err(Denial::CredentialDisabled { deleted: false });
    }
    if cred.is_expired(now) {
        return Err(Denial::CredentialExpired);
    }
    Ok(())
}

fn check_quota(cred: &Credential) -> Result<(), Denial> {
    if cred.token_used >= cred.token_limit {
        return Err(Denial::QuotaExceeded {
            limit: cred.token_limit,
            used: cred.token_used,
        });
    }
    Ok(())
}

fn check_network(
    cred: &Credential,
    client_ip: Option<&str>,
    origin: Option<&str>,
) -> Result<(), Denial> {
    if let Some(ip) = client_ip {
        if !cred.allowed_ips.is_empty() && !cred.allowed_ips.iter().any(|a| a.trim() == ip) {
            return Err(Denial::IpNotAllowed);
        }
    }
    if let Some(origin) = origin {
        let origin = origin.trim_end_matches('/');
        if !cred.allowed_origins.is_empty()
            && !cred
                .allowed_origins
                .iter()
                .any(|a| a.trim().trim_end_matches('/').eq_ignore_ascii_case(origin))
        {
            return Err(Denial::OriginNotAllowed);
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct Gate {
    store: Arc<dyn CredentialStore>,
}

impl Gate {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Full admission check for a call that will be forwarded.
    pub async fn admit(
        &self,
        secret: Option<&str>,
        client_ip: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Credential, GateError> {
        self.resolve(secret, client_ip, origin, true).await
    }

    /// Like [`Gate::admit`] but lets an exhausted quota through, so callers
    /// can still read their own usage.
    pub async fn inspect(
        &self,
        secret: Option<&str>,
        client_ip: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Credential, GateError> {
        self.resolve(secret, client_ip, origin, false).await
    }

    async fn resolve(
        &self,
        secret: Option<&str>,
        client_ip: Option<&str>,
        origin: Option<&str>,
        enforce_quota: bool,
    ) -> Result<Credential, GateError> {
        let Some(secret) = secret.filter(|s| !s.is_empty()) else {
            debug!("request without API key");
            return Err(Denial::CredentialInvalid.into());
        };

        let started = Instant::now();
        let found = self.store.find_by_hash(&hash_secret(secret)).await;
        log_store_latency(self.store.backend_name(), "lookup", started.elapsed());

        let Some(cred) = found? else {
            info!(key_prefix = %key_prefix(secret), "unknown API key");
            return Err(Denial::CredentialInvalid.into());
        };

        let verdict = if enforce_quota {
            check_policy(&cred, now_epoch(), client_ip, origin)
        } else {
            check_standing(&cred, now_epoch()).and_then(|_| check_network(&cred, client_ip, origin))
        };
        if let Err(denial) = verdict {
            info!(
                credential_id = %cred.id,
                reason = denial.kind(),
                client_ip = client_ip.unwrap_or("-"),
                "request denied"
            );
            return Err(denial.into());
        }

        debug!(credential_id = %cred.id, "request admitted");
        Ok(cred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemoryCredentialStore;
    use http::HeaderValue;

    fn cred() -> Credential {
        Credential::new("test", "sk-test", 100)
    }

    #[test]
    fn bearer_then_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  sk-one "));
        headers.insert("x-api-key", HeaderValue::from_static("sk-two"));
        assert_eq!(extract_secret(&headers).as_deref(), Some("sk-one"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_secret(&headers).as_deref(), Some("sk-two"));

        headers.remove("x-api-key");
        assert_eq!(extract_secret(&headers), None);
    }

    #[test]
    fn denial_precedence() {
        let mut c = cred();
        c.is_deleted = true;
        c.is_active = false;
        assert_eq!(
            check_policy(&c, 0, None, None),
            Err(Denial::CredentialDisabled { deleted: true })
        );

        let mut c = cred();
        c.is_active = false;
        c.token_used = 500;
        assert_eq!(
            check_policy(&c, 0, None, None),
            Err(Denial::CredentialDisabled { deleted: false })
        );

        let mut c = cred();
        c.expires_at = Some(10);
        assert_eq!(check_policy(&c, 11, None, None), Err(Denial::CredentialExpired));
        assert!(check_policy(&c, 10, None, None).is_ok());
    }

    #[test]
    fn quota_is_inclusive() {
        let mut c = cred();
        c.token_used = 99;
        assert!(check_policy(&c, 0, None, None).is_ok());
        c.token_used = 100;
        let denial = check_policy(&c, 0, None, None).unwrap_err();
        assert_eq!(denial.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn allow_lists_apply_only_when_set() {
        let mut c = cred();
        assert!(check_policy(&c, 0, Some("1.2.3.4"), Some("https://app.test")).is_ok());

        c.allowed_ips = vec!["10.0.0.1".into()];
        c.allowed_origins = vec!["https://app.test/".into()];
        assert_eq!(
            check_policy(&c, 0, Some("1.2.3.4"), None),
            Err(Denial::IpNotAllowed)
        );
        assert!(check_policy(&c, 0, Some("10.0.0.1"), Some("https://APP.test")).is_ok());
        assert_eq!(
            check_policy(&c, 0, Some("10.0.0.1"), Some("https://evil.test")),
            Err(Denial::OriginNotAllowed)
        );
        // Absent values are not checked.
        assert!(check_policy(&c, 0, None, None).is_ok());
    }

    #[tokio::test]
    async fn admit_resolves_by_hash() {
        let store = Arc::new(MemoryCredentialStore::new());
        let c = cred();
        store.insert(&c).await.unwrap();
        let gate = Gate::new(store);

        let admitted = gate.admit(Some("sk-test"), None, None).await.unwrap();
        assert_eq!(admitted.id, c.id);

        match gate.admit(Some("sk-wrong"), None, None).await {
            Err(GateError::Denied(Denial::CredentialInvalid)) => {}
            other => panic!("unexpected {:?}", other.map(|c| c.id)),
        }
        match gate.admit(None, None, None).await {
            Err(GateError::Denied(d)) => assert_eq!(d.status_code(), StatusCode::UNAUTHORIZED),
            other => panic!("unexpected {:?}", other.map(|c| c.id)),
        }
    }

    #[tokio::test]
    async fn inspect_ignores_exhausted_quota() {
        let store = Arc::new(MemoryCredentialStore::new());
        let mut c = cred();
        c.token_used = c.token_limit;
        store.insert(&c).await.unwrap();
        let gate = Gate::new(store);

        assert!(matches!(
            gate.admit(Some("sk-test"), None, None).await,
            Err(GateError::Denied(Denial::QuotaExceeded { .. }))
        ));
        let seen = gate.inspect(Some("sk-test"), None, None).await.unwrap();
        assert_eq!(seen.token_remaining(), 0);
    }
}
