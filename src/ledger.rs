//! Usage ledger: one immutable entry per forwarded attempt.
//!
//! Stores only append and list. Entries are never updated after they are
//! written; retention is handled outside the gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::credential::StoreError;
use crate::usage::UsageSource;
use crate::util::now_epoch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub request_id: String,
    pub credential_id: String,
    pub created_at: u64,
    pub method: String,
    pub path: String,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub status_code: u16,
    pub latency_ms: u64,
    pub attempts: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model: Option<String>,
    #[serde(default)]
    pub usage_source: UsageSource,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub is_error: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub client_ip: Option<String>,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl LedgerEntry {
    /// Blank entry stamped with a fresh id and the current time.
    pub fn new(request_id: &str, credential_id: &str, method: &str, path: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            credential_id: credential_id.to_string(),
            created_at: now_epoch(),
            method: method.to_string(),
            path: path.to_string(),
            request_bytes: 0,
            response_bytes: 0,
            status_code: 0,
            latency_ms: 0,
            attempts: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            model: None,
            usage_source: UsageSource::None,
            input_cost: 0.0,
            output_cost: 0.0,
            total_cost: 0.0,
            is_error: false,
            error_code: None,
            error_message: None,
            client_ip: None,
            origin: None,
            user_agent: None,
            metadata: None,
        }
    }
}

/// Window and page over one credential's entries. Bounds are inclusive
/// epoch seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerQuery {
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub skip: usize,
    /// `None` returns every matching entry.
    pub limit: Option<usize>,
}

impl LedgerQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn between(since: Option<u64>, until: Option<u64>) -> Self {
        Self {
            since,
            until,
            ..Self::default()
        }
    }

    pub fn contains(&self, created_at: u64) -> bool {
        self.since.map_or(true, |s| created_at >= s) && self.until.map_or(true, |u| created_at <= u)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Entries for a credential inside the query window, newest first.
    async fn query(
        &self,
        credential_id: &str,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Most recent entries for a credential, newest first.
    async fn list_for_credential(
        &self,
        credential_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        self.query(credential_id, &LedgerQuery::latest(limit)).await
    }

    fn backend_name(&self) -> &'static str;
}

fn newest_first(mut entries: Vec<LedgerEntry>, query: &LedgerQuery) -> Vec<LedgerEntry> {
    entries.retain(|e| query.contains(e.created_at));
    // Stable sort keeps append order for entries stamped in the same second.
    entries.reverse();
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    entries
        .into_iter()
        .skip(query.skip)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn query(
        &self,
        credential_id: &str,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let matching = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.credential_id == credential_id)
            .cloned()
            .collect();
        Ok(newest_first(matching, query))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Append-only JSON Lines file, one entry per line.
pub struct JsonlLedgerStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlLedgerStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn open_append(path: &Path) -> Result<File, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }

    fn read_all(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl LedgerStore for JsonlLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(entry)?;
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(Self::open_append(&self.path)?);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{}", line)?;
            file.flush()?;
        }
        Ok(())
    }

    async fn query(
        &self,
        credential_id: &str,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        // Hold the writer lock so a half-written line is never read.
        let _guard = self.file.lock().await;
        let matching = self
            .read_all()?
            .into_iter()
            .filter(|e| e.credential_id == credential_id)
            .collect();
        Ok(newest_first(matching, query))
    }

    fn backend_name(&self) -> &'static str {
        "jsonl"
    }
}

#[cfg(feature = "sqlite")]
mod sqlite_impl {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
    use sqlx::{ConnectOptions, Row};

    const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS usage_ledger (
            id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            credential_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            body TEXT NOT NULL
        )
    "#;

    const INDEX: &str =
        "CREATE INDEX IF NOT EXISTS idx_usage_ledger_credential ON usage_ledger (credential_id, created_at)";

    /// Indexed columns for lookup; the full entry is kept as JSON.
    pub struct SqliteLedgerStore {
        pool: SqlitePool,
    }

    impl SqliteLedgerStore {
        pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
            let options = SqliteConnectOptions::from_str(database_url)?
                .create_if_missing(true)
                .disable_statement_logging();
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;
            sqlx::query(SCHEMA).execute(&pool).await?;
            sqlx::query(INDEX).execute(&pool).await?;
            Ok(Self { pool })
        }
    }

    fn decode(row: &SqliteRow) -> Result<LedgerEntry, StoreError> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }

    #[async_trait]
    impl LedgerStore for SqliteLedgerStore {
        async fn append(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
            sqlx::query(
                "INSERT INTO usage_ledger (id, request_id, credential_id, created_at, body) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&entry.id)
            .bind(&entry.request_id)
            .bind(&entry.credential_id)
            .bind(entry.created_at as i64)
            .bind(serde_json::to_string(entry)?)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn query(
            &self,
            credential_id: &str,
            query: &LedgerQuery,
        ) -> Result<Vec<LedgerEntry>, StoreError> {
            let to_i64 = |n: u64| n.min(i64::MAX as u64) as i64;
            // LIMIT -1 means no limit in sqlite.
            let limit = query.limit.map_or(-1, |l| to_i64(l as u64));
            let rows = sqlx::query(
                "SELECT body FROM usage_ledger WHERE credential_id = ?1 \
                 AND created_at >= ?2 AND created_at <= ?3 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?4 OFFSET ?5",
            )
            .bind(credential_id)
            .bind(to_i64(query.since.unwrap_or(0)))
            .bind(to_i64(query.until.unwrap_or(u64::MAX)))
            .bind(limit)
            .bind(to_i64(query.skip as u64))
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(decode).collect()
        }

        fn backend_name(&self) -> &'static str {
            "sqlite"
        }
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_impl::SqliteLedgerStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerBackend {
    Memory,
    Jsonl { path: PathBuf },
    Sqlite { url: String },
}

impl Default for LedgerBackend {
    fn default() -> Self {
        LedgerBackend::Jsonl {
            path: PathBuf::from("./data/usage.jsonl"),
        }
    }
}

impl FromStr for LedgerBackend {
    type Err = StoreError;

    /// "memory", "jsonl:<path>" or "sqlite:<url>".
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("memory") {
            return Ok(LedgerBackend::Memory);
        }
        if let Some(rest) = spec.strip_prefix("jsonl:") {
            if !rest.is_empty() {
                return Ok(LedgerBackend::Jsonl {
                    path: PathBuf::from(rest),
                });
            }
        }
        if spec.starts_with("sqlite:") {
            return Ok(LedgerBackend::Sqlite {
                url: spec.to_string(),
            });
        }
        Err(StoreError::UnknownBackend(spec.to_string()))
    }
}

pub async fn open_ledger_store(backend: &LedgerBackend) -> Result<Arc<dyn LedgerStore>, StoreError> {
    let store: Arc<dyn LedgerStore> = match backend {
        LedgerBackend::Memory => Arc::new(MemoryLedgerStore::new()),
        LedgerBackend::Jsonl { path } => Arc::new(JsonlLedgerStore::new(path)),
        #[cfg(feature = "sqlite")]
        LedgerBackend::Sqlite { url } => Arc::new(SqliteLedgerStore::connect(url).await?),
        #[cfg(not(feature = "sqlite"))]
        LedgerBackend::Sqlite { .. } => {
            return Err(StoreError::UnknownBackend(
                "sqlite backend requires the `sqlite` feature".into(),
            ))
        }
    };
    info!(backend = store.backend_name(), "usage ledger ready");
    Ok(store)
}
