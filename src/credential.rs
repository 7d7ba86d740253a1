/* relaygate/src/credential.rs

Credential model and pluggable credential stores.

Credentials are created and retired by the key-management tooling; the
gateway only reads them and applies usage deltas. Secrets are never stored:
lookups go through `hash_secret`, the lowercase hex SHA-256 of the secret.

Backends:
- memory  - process-local map, used by tests and throwaway deployments.
- sled    - embedded store (feature "sled", on by default). A second tree maps
            key hash -> credential id.
- sqlite  - sqlx pool (feature "sqlite").

Counter updates (`increment_usage`, `increment_error_count`) are single atomic
mutations in every backend. Nothing in this module reads a counter and writes
it back in a separate step.

Backend spec strings (CLI / env / config):
- "memory"
- "sled:<path>"
- "sqlite:<url>"   e.g. "sqlite://data/relaygate.db"
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::util::now_epoch;

const KEY_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown storage backend spec: {0}")]
    UnknownBackend(String),
}

#[cfg(feature = "sled")]
impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Lowercase hex SHA-256 of a caller secret.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Short, loggable prefix of a secret.
pub fn key_prefix(secret: &str) -> String {
    secret.chars().take(KEY_PREFIX_LEN).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub token_limit: u64,
    #[serde(default)]
    pub token_used: u64,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: u64,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub deleted_at: Option<u64>,
    /// Empty means any address.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Credential {
    /// Fresh active credential for `secret`. Only the hash and a short prefix
    /// are kept.
    pub fn new(name: impl Into<String>, secret: &str, token_limit: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            key_hash: hash_secret(secret),
            key_prefix: key_prefix(secret),
            token_limit,
            token_used: 0,
            request_count: 0,
            error_count: 0,
            is_active: true,
            is_deleted: false,
            created_at: now_epoch(),
            last_used_at: None,
            expires_at: None,
            deleted_at: None,
            allowed_ips: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    pub fn token_remaining(&self) -> u64 {
        self.token_limit.saturating_sub(self.token_used)
    }

    pub fn usage_percentage(&self) -> f64 {
        if self.token_limit == 0 {
            return 0.0;
        }
        self.token_used as f64 / self.token_limit as f64 * 100.0
    }

    fn apply_usage(&mut self, tokens: u64, increment_request_count: bool, now: u64) {
        self.token_used = self.token_used.saturating_add(tokens);
        if increment_request_count {
            self.request_count = self.request_count.saturating_add(1);
        }
        self.last_used_at = Some(now);
    }

    fn apply_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up by secret hash. Soft-deleted rows are returned too; the gate
    /// decides how to deny them.
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, StoreError>;

    async fn insert(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Atomically add `tokens` to `token_used` (and one to `request_count`
    /// when asked) and stamp `last_used_at`. `false` when the id is unknown.
    async fn increment_usage(
        &self,
        id: &str,
        tokens: u64,
        increment_request_count: bool,
    ) -> Result<bool, StoreError>;

    async fn increment_error_count(&self, id: &str) -> Result<bool, StoreError>;

    fn backend_name(&self) -> &'static str;
}

// ==============================
// memory backend
// ==============================

#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: tokio::sync::RwLock<std::collections::HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.values().find(|c| c.key_hash == key_hash).cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn insert(&self, credential: &Credential) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn increment_usage(
        &self,
        id: &str,
        tokens: u64,
        increment_request_count: bool,
    ) -> Result<bool, StoreError> {
        let now = now_epoch();
        let mut guard = self.inner.write().await;
        match guard.get_mut(id) {
            Some(cred) => {
                cred.apply_usage(tokens, increment_request_count, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_error_count(&self, id: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write().await;
        match guard.get_mut(id) {
            Some(cred) => {
                cred.apply_error();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ==============================
// sled backend (feature: sled)
// ==============================

#[cfg(feature = "sled")]
mod sled_impl {
    use super::*;
    use std::path::Path;

    pub struct SledCredentialStore {
        _db: sled::Db,
        records: sled::Tree,
        hashes: sled::Tree,
    }

    impl SledCredentialStore {
        pub fn open(path: &Path) -> Result<Self, StoreError> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let db = sled::open(path)?;
            let records = db.open_tree("credentials")?;
            let hashes = db.open_tree("credential_hashes")?;
            Ok(Self {
                _db: db,
                records,
                hashes,
            })
        }

        /// Read-modify-write inside sled's CAS loop. `mutate` may run more
        /// than once under contention; each run starts from the stored value.
        fn update<F>(&self, id: &str, mut mutate: F) -> Result<bool, StoreError>
        where
            F: FnMut(&mut Credential),
        {
            let mut applied = false;
            let mut decode_error = None;
            self.records.update_and_fetch(id.as_bytes(), |current| {
                applied = false;
                let bytes = current?;
                let mut cred = match serde_json::from_slice::<Credential>(bytes) {
                    Ok(cred) => cred,
                    Err(err) => {
                        // Returning None would delete the key.
                        decode_error = Some(err);
                        return Some(bytes.to_vec());
                    }
                };
                mutate(&mut cred);
                match serde_json::to_vec(&cred) {
                    Ok(encoded) => {
                        applied = true;
                        Some(encoded)
                    }
                    Err(err) => {
                        decode_error = Some(err);
                        Some(bytes.to_vec())
                    }
                }
            })?;
            if let Some(err) = decode_error {
                return Err(StoreError::Serialization(err));
            }
            Ok(applied)
        }
    }

    #[async_trait]
    impl CredentialStore for SledCredentialStore {
        async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, StoreError> {
            match self.hashes.get(key_hash.as_bytes())? {
                Some(id) => {
                    let id = String::from_utf8_lossy(&id).into_owned();
                    self.find_by_id(&id).await
                }
                None => Ok(None),
            }
        }

        async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, StoreError> {
            match self.records.get(id.as_bytes())? {
                Some(ivec) => Ok(Some(serde_json::from_slice(&ivec)?)),
                None => Ok(None),
            }
        }

        async fn insert(&self, credential: &Credential) -> Result<(), StoreError> {
            let value = serde_json::to_vec(credential)?;
            self.records.insert(credential.id.as_bytes(), value)?;
            self.hashes
                .insert(credential.key_hash.as_bytes(), credential.id.as_bytes())?;
            self.records.flush_async().await?;
            Ok(())
        }

        async fn increment_usage(
            &self,
            id: &str,
            tokens: u64,
            increment_request_count: bool,
        ) -> Result<bool, StoreError> {
            let now = now_epoch();
            self.update(id, |cred| cred.apply_usage(tokens, increment_request_count, now))
        }

        async fn increment_error_count(&self, id: &str) -> Result<bool, StoreError> {
            self.update(id, Credential::apply_error)
        }

        fn backend_name(&self) -> &'static str {
            "sled"
        }
    }
}

#[cfg(feature = "sled")]
pub use sled_impl::SledCredentialStore;

// ==============================
// sqlite backend (feature: sqlite)
// ==============================

#[cfg(feature = "sqlite")]
mod sqlite_impl {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::{ConnectOptions, Row};

    const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            key_prefix TEXT NOT NULL,
            token_limit INTEGER NOT NULL,
            token_used INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER,
            expires_at INTEGER,
            deleted_at INTEGER,
            allowed_ips TEXT NOT NULL DEFAULT '[]',
            allowed_origins TEXT NOT NULL DEFAULT '[]'
        )
    "#;

    const COLUMNS: &str = "id, name, key_hash, key_prefix, token_limit, token_used, \
        request_count, error_count, is_active, is_deleted, created_at, last_used_at, \
        expires_at, deleted_at, allowed_ips, allowed_origins";

    #[derive(Clone)]
    pub struct SqliteCredentialStore {
        pool: SqlitePool,
    }

    impl SqliteCredentialStore {
        pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
            let options = SqliteConnectOptions::from_str(database_url)?
                .create_if_missing(true)
                .disable_statement_logging();
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;
            sqlx::query(SCHEMA).execute(&pool).await?;
            Ok(Self { pool })
        }

        fn from_row(row: &SqliteRow) -> Result<Credential, StoreError> {
            let allowed_ips: String = row.try_get("allowed_ips")?;
            let allowed_origins: String = row.try_get("allowed_origins")?;
            Ok(Credential {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                key_hash: row.try_get("key_hash")?,
                key_prefix: row.try_get("key_prefix")?,
                token_limit: row.try_get::<i64, _>("token_limit")?.max(0) as u64,
                token_used: row.try_get::<i64, _>("token_used")?.max(0) as u64,
                request_count: row.try_get::<i64, _>("request_count")?.max(0) as u64,
                error_count: row.try_get::<i64, _>("error_count")?.max(0) as u64,
                is_active: row.try_get("is_active")?,
                is_deleted: row.try_get("is_deleted")?,
                created_at: row.try_get::<i64, _>("created_at")?.max(0) as u64,
                last_used_at: opt_epoch(row.try_get("last_used_at")?),
                expires_at: opt_epoch(row.try_get("expires_at")?),
                deleted_at: opt_epoch(row.try_get("deleted_at")?),
                allowed_ips: serde_json::from_str(&allowed_ips)?,
                allowed_origins: serde_json::from_str(&allowed_origins)?,
            })
        }

        async fn find_where(&self, column: &str, value: &str) -> Result<Option<Credential>, StoreError> {
            let sql = format!("SELECT {COLUMNS} FROM credentials WHERE {column} = ?1");
            let row = sqlx::query(&sql)
                .bind(value)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::from_row).transpose()
        }
    }

    fn opt_epoch(value: Option<i64>) -> Option<u64> {
        value.map(|v| v.max(0) as u64)
    }

    #[async_trait]
    impl CredentialStore for SqliteCredentialStore {
        async fn find_by_hash(&self, key_hash: &str) -> Result<Option<Credential>, StoreError> {
            self.find_where("key_hash", key_hash).await
        }

        async fn find_by_id(&self, id: &str) -> Result<Option<Credential>, StoreError> {
            self.find_where("id", id).await
        }

        async fn insert(&self, c: &Credential) -> Result<(), StoreError> {
            sqlx::query(&format!(
                "INSERT INTO credentials ({COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ))
            .bind(&c.id)
            .bind(&c.name)
            .bind(&c.key_hash)
            .bind(&c.key_prefix)
            .bind(c.token_limit as i64)
            .bind(c.token_used as i64)
            .bind(c.request_count as i64)
            .bind(c.error_count as i64)
            .bind(c.is_active)
            .bind(c.is_deleted)
            .bind(c.created_at as i64)
            .bind(c.last_used_at.map(|v| v as i64))
            .bind(c.expires_at.map(|v| v as i64))
            .bind(c.deleted_at.map(|v| v as i64))
            .bind(serde_json::to_string(&c.allowed_ips)?)
            .bind(serde_json::to_string(&c.allowed_origins)?)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn increment_usage(
            &self,
            id: &str,
            tokens: u64,
            increment_request_count: bool,
        ) -> Result<bool, StoreError> {
            let result = sqlx::query(
                "UPDATE credentials SET token_used = token_used + ?1, \
                 request_count = request_count + ?2, last_used_at = ?3 WHERE id = ?4",
            )
            .bind(tokens as i64)
            .bind(if increment_request_count { 1i64 } else { 0i64 })
            .bind(now_epoch() as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn increment_error_count(&self, id: &str) -> Result<bool, StoreError> {
            let result = sqlx::query("UPDATE credentials SET error_count = error_count + 1 WHERE id = ?1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        fn backend_name(&self) -> &'static str {
            "sqlite"
        }
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_impl::SqliteCredentialStore;

// ==============================
// backend selection
// ==============================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialBackend {
    Memory,
    Sled { path: std::path::PathBuf },
    Sqlite { url: String },
}

impl Default for CredentialBackend {
    fn default() -> Self {
        CredentialBackend::Sled {
            path: std::path::PathBuf::from("./data/credentials.db"),
        }
    }
}

impl FromStr for CredentialBackend {
    type Err = StoreError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("memory") {
            return Ok(CredentialBackend::Memory);
        }
        if let Some(rest) = spec.strip_prefix("sled:") {
            if !rest.is_empty() {
                return Ok(CredentialBackend::Sled {
                    path: std::path::PathBuf::from(rest),
                });
            }
        }
        if spec.starts_with("sqlite:") {
            return Ok(CredentialBackend::Sqlite {
                url: spec.to_string(),
            });
        }
        Err(StoreError::UnknownBackend(spec.to_string()))
    }
}

pub async fn open_credential_store(
    backend: &CredentialBackend,
) -> Result<Arc<dyn CredentialStore>, StoreError> {
    let store: Arc<dyn CredentialStore> = match backend {
        CredentialBackend::Memory => Arc::new(MemoryCredentialStore::new()),
        #[cfg(feature = "sled")]
        CredentialBackend::Sled { path } => Arc::new(SledCredentialStore::open(path)?),
        #[cfg(not(feature = "sled"))]
        CredentialBackend::Sled { .. } => {
            return Err(StoreError::UnknownBackend(
                "sled backend requires the `sled` feature".into(),
            ))
        }
        #[cfg(feature = "sqlite")]
        CredentialBackend::Sqlite { url } => Arc::new(SqliteCredentialStore::connect(url).await?),
        #[cfg(not(feature = "sqlite"))]
        CredentialBackend::Sqlite { .. } => {
            return Err(StoreError::UnknownBackend(
                "sqlite backend requires the `sqlite` feature".into(),
            ))
        }
    };
    info!(backend = store.backend_name(), "credential store ready");
    Ok(store)
}
