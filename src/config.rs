//! Gateway configuration.
//!
//! Sources, in order of precedence (later wins):
//! 1. built-in defaults
//! 2. optional YAML file; string values may reference `${VAR}`
//! 3. environment overrides (`RELAYGATE_BIND_ADDR`, `UPSTREAM_API_URL`,
//!    `UPSTREAM_API_KEY`, `UPSTREAM_TIMEOUT`, `UPSTREAM_MAX_RETRIES`,
//!    `RELAYGATE_CREDENTIAL_BACKEND`, `RELAYGATE_LEDGER_BACKEND`,
//!    `CORS_ALLOWED_ORIGINS`)
//!
//! The result is validated once and is immutable afterwards.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::credential::{CredentialBackend, StoreError};
use crate::forwarder::ForwarderConfig;
use crate::ledger::LedgerBackend;
use crate::pricing::{ModelPricing, PricingTable};
use crate::tokens::EstimationMode;

static ENV_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env placeholder regex is valid"));

/// Placeholders that must resolve to a non-empty value.
const CRITICAL_VARS: &[&str] = &["UPSTREAM_API_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error(transparent)]
    Backend(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    /// Model prefix -> price override. `default` replaces the fallback.
    pub pricing: HashMap<String, ModelPricing>,
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Empty or `*` allows any origin.
    pub cors_origins: Vec<String>,
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_origins: vec!["*".to_string()],
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub max_connections: usize,
    pub max_idle_per_host: usize,
    pub pool_idle_timeout_seconds: u64,
    pub proxy_url: Option<String>,
    pub no_proxy: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: String::new(),
            timeout_seconds: 60,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            max_connections: 100,
            max_idle_per_host: 20,
            pool_idle_timeout_seconds: 90,
            proxy_url: None,
            no_proxy: false,
        }
    }
}

// Keeps the upstream key out of logs.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_cap_ms", &self.backoff_cap_ms)
            .field("max_connections", &self.max_connections)
            .field("max_idle_per_host", &self.max_idle_per_host)
            .field("pool_idle_timeout_seconds", &self.pool_idle_timeout_seconds)
            .field("proxy_url", &self.proxy_url)
            .field("no_proxy", &self.no_proxy)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Credential backend spec: `memory`, `sled:<path>` or `sqlite:<url>`.
    pub credentials: String,
    /// Ledger backend spec: `memory`, `jsonl:<path>` or `sqlite:<url>`.
    pub ledger: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials: "sled:./data/credentials.db".to_string(),
            ledger: "jsonl:./data/usage.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Path prefixes served (or hidden) by the gateway itself.
    pub reserved_prefixes: Vec<String>,
    pub token_estimation: EstimationMode,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            reserved_prefixes: ["admin/", "dashboard", "static/", "user-login", "user-dashboard"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            token_estimation: EstimationMode::default(),
        }
    }
}

/// Replace every `${VAR}` in `value` using `lookup`. Unset variables become
/// empty strings, except the critical ones which are an error.
pub fn substitute_env<F>(value: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let replaced = ENV_PLACEHOLDER.replace_all(value, |caps: &regex::Captures<'_>| {
        let name = caps[1].trim();
        match lookup(name).filter(|v| !v.is_empty()) {
            Some(v) => v,
            None => {
                if CRITICAL_VARS.contains(&name) {
                    missing.get_or_insert_with(|| name.to_string());
                }
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnv(name)),
        None => Ok(replaced.into_owned()),
    }
}

fn substitute_tree<F>(value: &mut serde_yaml::Value, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        serde_yaml::Value::String(s) => {
            *s = substitute_env(s, lookup)?;
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                substitute_tree(item, lookup)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_tree(v, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

impl GatewayConfig {
    /// Parse YAML text, substituting `${VAR}` through `lookup`.
    pub fn from_yaml_str<F>(text: &str, origin: &Path, lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut tree: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        if tree.is_null() {
            return Ok(Self::default());
        }
        substitute_tree(&mut tree, lookup)?;
        serde_yaml::from_value(tree).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let lookup = |name: &str| std::env::var(name).ok();
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml_str(&text, path, &lookup)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RELAYGATE_BIND_ADDR") {
            self.server.bind_addr = v.trim().to_string();
        }
        if let Some(v) = get("UPSTREAM_API_URL") {
            self.upstream.base_url = v.trim().to_string();
        }
        if let Some(v) = get("UPSTREAM_API_KEY") {
            self.upstream.api_key = v.trim().to_string();
        }
        if let Some(v) = get("UPSTREAM_TIMEOUT") {
            self.upstream.timeout_seconds = parse_env("UPSTREAM_TIMEOUT", &v)?;
        }
        if let Some(v) = get("UPSTREAM_MAX_RETRIES") {
            self.upstream.max_retries = parse_env("UPSTREAM_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RELAYGATE_CREDENTIAL_BACKEND") {
            self.storage.credentials = v.trim().to_string();
        }
        if let Some(v) = get("RELAYGATE_LEDGER_BACKEND") {
            self.storage.ledger = v.trim().to_string();
        }
        if let Some(v) = get("CORS_ALLOWED_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.api_key.trim().is_empty() {
            return Err(ConfigError::MissingEnv("UPSTREAM_API_KEY".to_string()));
        }
        let base = self.upstream.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "upstream.base_url",
                value: self.upstream.base_url.clone(),
            });
        }
        if self.upstream.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upstream.timeout_seconds",
                value: "0".to_string(),
            });
        }
        if self.upstream.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upstream.max_connections",
                value: "0".to_string(),
            });
        }
        self.credential_backend()?;
        self.ledger_backend()?;
        Ok(())
    }

    pub fn credential_backend(&self) -> Result<CredentialBackend, ConfigError> {
        Ok(self.storage.credentials.parse()?)
    }

    pub fn ledger_backend(&self) -> Result<LedgerBackend, ConfigError> {
        Ok(self.storage.ledger.parse()?)
    }

    pub fn forwarder_config(&self) -> ForwarderConfig {
        let u = &self.upstream;
        ForwarderConfig {
            base_url: u.base_url.trim().to_string(),
            upstream_key: u.api_key.clone(),
            timeout: Duration::from_secs(u.timeout_seconds),
            max_retries: u.max_retries,
            backoff_unit: Duration::from_millis(u.backoff_base_ms),
            backoff_cap: Duration::from_millis(u.backoff_cap_ms),
            max_connections: u.max_connections,
            max_idle_per_host: u.max_idle_per_host,
            pool_idle_timeout: Duration::from_secs(u.pool_idle_timeout_seconds),
            proxy_url: u.proxy_url.clone(),
            no_proxy: u.no_proxy,
        }
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::with_overrides(&self.pricing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn substitution_replaces_and_blanks() {
        let lookup = env(&[("HOST", "api.test")]);
        assert_eq!(
            substitute_env("https://${HOST}/v1", &lookup).unwrap(),
            "https://api.test/v1"
        );
        assert_eq!(substitute_env("x${UNSET}y", &lookup).unwrap(), "xy");
        assert!(matches!(
            substitute_env("${UPSTREAM_API_KEY}", &lookup),
            Err(ConfigError::MissingEnv(name)) if name == "UPSTREAM_API_KEY"
        ));
    }

    #[test]
    fn yaml_file_with_placeholders() {
        let yaml = r#"
server:
  bind_addr: "127.0.0.1:9000"
upstream:
  base_url: "${UPSTREAM_BASE}"
  api_key: "${UPSTREAM_API_KEY}"
  max_retries: 5
storage:
  credentials: memory
  ledger: "jsonl:/tmp/usage.jsonl"
pricing:
  my-model:
    input: 0.5
    output: 1.0
gateway:
  token_estimation: heuristic
"#;
        let lookup = env(&[
            ("UPSTREAM_BASE", "http://upstream.local/v1"),
            ("UPSTREAM_API_KEY", "sk-upstream"),
        ]);
        let cfg = GatewayConfig::from_yaml_str(yaml, Path::new("test.yaml"), &lookup).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.upstream.base_url, "http://upstream.local/v1");
        assert_eq!(cfg.upstream.max_retries, 5);
        assert_eq!(cfg.upstream.timeout_seconds, 60);
        assert_eq!(cfg.credential_backend().unwrap(), CredentialBackend::Memory);
        assert_eq!(cfg.gateway.token_estimation, EstimationMode::Heuristic);
        assert_eq!(
            cfg.pricing_table().for_model(Some("my-model-v2")),
            ModelPricing::new(0.5, 1.0)
        );
        assert!(cfg.gateway.reserved_prefixes.contains(&"admin/".to_string()));
        assert!(cfg.gateway.reserved_prefixes.contains(&"user-dashboard".to_string()));
    }

    #[test]
    fn yaml_missing_critical_key_fails() {
        let yaml = "upstream:\n  api_key: \"${UPSTREAM_API_KEY}\"\n";
        let err = GatewayConfig::from_yaml_str(yaml, Path::new("x.yaml"), &env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(_)));
    }

    #[test]
    fn env_overrides_win() {
        let mut cfg = GatewayConfig::default();
        cfg.apply_env_overrides(&env(&[
            ("UPSTREAM_API_KEY", "sk-env"),
            ("UPSTREAM_TIMEOUT", "15"),
            ("UPSTREAM_MAX_RETRIES", "1"),
            ("RELAYGATE_LEDGER_BACKEND", "memory"),
            ("CORS_ALLOWED_ORIGINS", "https://a.test, https://b.test"),
        ]))
        .unwrap();
        cfg.validate().unwrap();

        let fwd = cfg.forwarder_config();
        assert_eq!(fwd.upstream_key, "sk-env");
        assert_eq!(fwd.timeout, Duration::from_secs(15));
        assert_eq!(fwd.max_retries, 1);
        assert_eq!(fwd.backoff_cap, Duration::from_secs(30));
        assert_eq!(cfg.ledger_backend().unwrap(), LedgerBackend::Memory);
        assert_eq!(cfg.server.cors_origins, vec!["https://a.test", "https://b.test"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = GatewayConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingEnv(_))));

        cfg.upstream.api_key = "k".into();
        cfg.upstream.base_url = "ftp://nope".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));

        cfg.upstream.base_url = "https://ok".into();
        cfg.storage.credentials = "redis://x".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Backend(_))));

        let err = cfg
            .apply_env_overrides(&env(&[("UPSTREAM_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "UPSTREAM_TIMEOUT", .. }));
    }

    #[test]
    fn debug_redacts_upstream_key() {
        let mut cfg = UpstreamConfig::default();
        cfg.api_key = "sk-very-secret".into();
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
