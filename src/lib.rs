#![forbid(unsafe_code)]
#![doc = r#"
Relaygate

Quota-enforcing relay for a third-party language-model API. Callers present
their own API key; the gateway checks it against a credential store, forwards
the call upstream with the operator's key, extracts token usage from the
response (JSON or event stream, estimated when the upstream reports none) and
records one ledger entry per forwarded call.

Modules
- `gate`: credential lookup and admission policy.
- `forwarder`: pooled upstream client, header sanitation, retry with backoff.
- `usage` / `tokens`: usage extraction and token estimation.
- `recorder`: ledger entry plus atomic quota update.
- `gateway`: per-call orchestration and caller-facing errors.
- `credential` / `ledger`: storage backends (memory, sled, jsonl, sqlite).
- `stats`: per-credential usage statistics and daily totals.
- `server`: actix-web routes; `config`: YAML + env configuration.
"#]

pub mod config;
pub mod credential;
pub mod forwarder;
pub mod gate;
pub mod gateway;
pub mod ledger;
pub mod pricing;
pub mod recorder;
pub mod server;
pub mod stats;
pub mod tokens;
pub mod usage;
pub mod util;

pub use crate::config::{ConfigError, GatewayConfig};
pub use crate::credential::{
    hash_secret, open_credential_store, Credential, CredentialBackend, CredentialStore,
    MemoryCredentialStore, StoreError,
};
pub use crate::forwarder::{ForwardError, Forwarder, ForwarderConfig, UpstreamResponse};
pub use crate::gate::{Denial, Gate};
pub use crate::gateway::{Gateway, GatewayError, GatewayResponse, InboundRequest};
pub use crate::ledger::{
    open_ledger_store, LedgerBackend, LedgerEntry, LedgerQuery, LedgerStore, MemoryLedgerStore,
};
pub use crate::pricing::{CostBreakdown, ModelPricing, PricingTable};
pub use crate::recorder::{Outcome, UsageRecorder};
pub use crate::server::{config_routes, AppState};
pub use crate::stats::{daily_usage, DailyUsage, UsageStatistics};
pub use crate::tokens::{EstimationMode, TokenEstimator};
pub use crate::usage::{extract_usage, UsageSnapshot, UsageSource};
