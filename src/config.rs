use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::db::{Backend, MemoryBackend, PostgresBackend, SqliteBackend};

/// Substitute `${NAME}` and `$NAME` references with the named environment
/// variable; unset variables expand to the empty string. Expanded values
/// are not re-scanned.
fn expand_env(raw: &str) -> String {
  let reference = regex::Regex::new(r"\$\{(\w+)\}|\$(\w+)")
    .unwrap_or_else(|_| regex::Regex::new("^$").unwrap());
  reference
    .replace_all(raw, |caps: &regex::Captures| {
      caps
        .get(1)
        .or_else(|| caps.get(2))
        .and_then(|name| std::env::var(name.as_str()).ok())
        .unwrap_or_default()
    })
    .into_owned()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  #[default]
  Sqlite,
  Postgres,
  Memory,
}

/// Top-level configuration: which backend to open plus the cache layer
/// tuning knobs. Every field falls back to its default when absent from
/// the loaded file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub backend: BackendType,
  pub sqlite: SqliteSection,
  pub postgres: PostgresSection,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSection {
  /// Database file; `:memory:` opens a transient in-memory store.
  pub path: String,
}

impl Default for SqliteSection {
  fn default() -> Self {
    Self {
      path: "hoarddb.db".into(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSection {
  pub url: String,
  pub max_connections: usize,
}

impl Default for PostgresSection {
  fn default() -> Self {
    Self {
      url: "postgres://localhost/hoarddb".into(),
      max_connections: 20,
    }
  }
}

/// Tuning knobs for the cache-and-buffer layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Maximum number of clean entries kept in the value cache.
  pub cache: usize,

  /// Milliseconds between periodic flushes of the write buffer.
  /// 0 means write-through: every accepted write triggers a flush.
  pub write_interval_ms: u64,

  /// Serialize values to JSON text when crossing the backend boundary.
  /// When false, values must already be strings and pass through raw.
  pub json: bool,

  /// Minimum number of clean entries reclaimed per eviction pass once the
  /// cap is exceeded. Defaults to 10% of `cache`.
  pub cache_min_gap: Option<usize>,

  /// Timeout applied to backend reads and bulk writes. 0 disables it.
  pub op_timeout_ms: u64,

  /// Number of times a failed flush batch is retried before the error is
  /// reported to its writers. Off by default: a failed flush is terminal.
  pub flush_retries: u32,

  /// Base backoff between flush retries; doubles per attempt.
  pub flush_retry_backoff_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      cache: 1000,
      write_interval_ms: 100,
      json: true,
      cache_min_gap: None,
      op_timeout_ms: 60_000,
      flush_retries: 0,
      flush_retry_backoff_ms: 50,
    }
  }
}

impl CacheConfig {
  /// Effective eviction batch size.
  pub fn min_gap(&self) -> usize {
    self.cache_min_gap.unwrap_or(self.cache / 10).max(1)
  }
}

impl StoreConfig {
  /// Load from a YAML file, expanding environment references first.
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_yaml::from_str(&expand_env(&raw))?)
  }

  /// Look for `hoarddb.yaml` / `hoarddb.yml` in the working directory.
  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    match ["hoarddb.yaml", "hoarddb.yml"]
      .into_iter()
      .map(Path::new)
      .find(|p| p.exists())
    {
      Some(found) => {
        tracing::info!(path = %found.display(), "loading config");
        Self::from_file(found).map(Some)
      }
      None => Ok(None),
    }
  }

  /// Construct the configured backend. The returned handle has not been
  /// initialized; call `Database::init` (or `Backend::init`) before use.
  pub async fn open_backend(&self) -> Result<Arc<dyn Backend>, anyhow::Error> {
    Ok(match self.backend {
      BackendType::Sqlite => Arc::new(SqliteBackend::new(&self.sqlite.path).await?),
      BackendType::Postgres => Arc::new(PostgresBackend::new(
        &self.postgres.url,
        self.postgres.max_connections,
      )?),
      BackendType::Memory => Arc::new(MemoryBackend::new()),
    })
  }
}
