//! Usage recording.
//!
//! Every admitted call that reached the forwarder produces exactly one ledger
//! entry through [`UsageRecorder::record`]. The entry is written first, then
//! the credential counters move:
//!
//! * completed with `total_tokens > 0`: one atomic `increment_usage`
//!   (tokens plus one request)
//! * failed: one `increment_error_count`
//! * cancelled by the caller: nothing, the upstream outcome was never seen
//!
//! Persistence errors are logged and swallowed. The caller's response is
//! already decided by the time the recorder runs.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::credential::CredentialStore;
use crate::forwarder::ForwardError;
use crate::ledger::{LedgerEntry, LedgerStore};
use crate::pricing::PricingTable;
use crate::usage::UsageSnapshot;
use crate::util::log_store_latency;

/// Ledger status for a caller that went away before the response.
pub const CLIENT_CLOSED_STATUS: u16 = 499;
pub const CLIENT_CLOSED_CODE: &str = "CLIENT_CLOSED";

/// Request-side facts about one forwarded call.
#[derive(Debug, Clone)]
pub struct AttemptInfo {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub request_bytes: u64,
    pub client_ip: Option<String>,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub started: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The upstream answered with a non-retryable status.
    Completed {
        status: u16,
        response_bytes: u64,
        attempts: u32,
    },
    /// Terminal forwarding failure.
    Failed {
        code: &'static str,
        message: String,
        status: u16,
        attempts: u32,
    },
    Cancelled,
}

impl Outcome {
    pub fn from_error(err: &ForwardError) -> Self {
        let status = match err {
            ForwardError::Timeout { .. } => 504,
            _ => 502,
        };
        Outcome::Failed {
            code: err.code(),
            message: err.to_string(),
            status,
            attempts: err.attempts(),
        }
    }
}

#[derive(Clone)]
pub struct UsageRecorder {
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn LedgerStore>,
    pricing: Arc<PricingTable>,
}

impl UsageRecorder {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn LedgerStore>,
        pricing: Arc<PricingTable>,
    ) -> Self {
        Self {
            credentials,
            ledger,
            pricing,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Build the ledger entry for one call without persisting it.
    pub fn build_entry(
        &self,
        credential_id: &str,
        attempt: &AttemptInfo,
        usage: &UsageSnapshot,
        outcome: &Outcome,
        latency: Duration,
    ) -> LedgerEntry {
        let mut entry = LedgerEntry::new(
            &attempt.request_id,
            credential_id,
            &attempt.method,
            &attempt.path,
        );
        entry.request_bytes = attempt.request_bytes;
        entry.latency_ms = latency.as_millis() as u64;
        entry.client_ip = attempt.client_ip.clone();
        entry.origin = attempt.origin.clone();
        entry.user_agent = attempt.user_agent.clone();

        match outcome {
            Outcome::Completed {
                status,
                response_bytes,
                attempts,
            } => {
                let cost = self.pricing.cost(
                    usage.model.as_deref(),
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
                entry.status_code = *status;
                entry.response_bytes = *response_bytes;
                entry.attempts = *attempts;
                entry.prompt_tokens = usage.prompt_tokens;
                entry.completion_tokens = usage.completion_tokens;
                entry.total_tokens = usage.total_tokens;
                entry.model = usage.model.clone();
                entry.usage_source = usage.source;
                entry.input_cost = cost.input_cost;
                entry.output_cost = cost.output_cost;
                entry.total_cost = cost.total_cost;
                entry.is_error = *status >= 400;
            }
            Outcome::Failed {
                code,
                message,
                status,
                attempts,
            } => {
                entry.status_code = *status;
                entry.attempts = *attempts;
                entry.is_error = true;
                entry.error_code = Some((*code).to_string());
                entry.error_message = Some(message.clone());
            }
            Outcome::Cancelled => {
                entry.status_code = CLIENT_CLOSED_STATUS;
                entry.is_error = true;
                entry.error_code = Some(CLIENT_CLOSED_CODE.to_string());
                entry.error_message = Some("client closed the connection".to_string());
            }
        }
        entry
    }

    /// Persist one call. Returns the ledger entry that was attempted.
    pub async fn record(
        &self,
        credential_id: &str,
        attempt: &AttemptInfo,
        usage: &UsageSnapshot,
        outcome: &Outcome,
    ) -> LedgerEntry {
        let entry = self.build_entry(
            credential_id,
            attempt,
            usage,
            outcome,
            attempt.started.elapsed(),
        );

        let started = Instant::now();
        if let Err(err) = self.ledger.append(&entry).await {
            error!(
                request_id = %attempt.request_id,
                credential_id,
                error = %err,
                "failed to append usage ledger entry"
            );
        }
        log_store_latency(self.ledger.backend_name(), "append", started.elapsed());

        match outcome {
            Outcome::Completed { .. } if usage.total_tokens > 0 => {
                match self
                    .credentials
                    .increment_usage(credential_id, usage.total_tokens, true)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => info!(credential_id, "credential vanished before usage update"),
                    Err(err) => error!(
                        request_id = %attempt.request_id,
                        credential_id,
                        error = %err,
                        "failed to update token usage"
                    ),
                }
            }
            Outcome::Completed { .. } => {
                debug!(request_id = %attempt.request_id, "no tokens to charge");
            }
            Outcome::Failed { .. } => {
                if let Err(err) = self.credentials.increment_error_count(credential_id).await {
                    error!(
                        request_id = %attempt.request_id,
                        credential_id,
                        error = %err,
                        "failed to update error count"
                    );
                }
            }
            Outcome::Cancelled => {}
        }

        info!(
            request_id = %entry.request_id,
            credential_id,
            status = entry.status_code,
            total_tokens = entry.total_tokens,
            model = entry.model.as_deref().unwrap_or("-"),
            latency_ms = entry.latency_ms,
            error_code = entry.error_code.as_deref().unwrap_or("-"),
            "usage recorded"
        );
        entry
    }
}
