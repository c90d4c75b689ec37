use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use super::backend::{glob_to_like, Backend, BulkOp};

/// Keys are capped at 100 bytes so the primary key stays index-friendly.
const MAX_KEY_LEN: usize = 100;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store (
    key VARCHAR(100) PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const UPSERT: &str = "INSERT INTO store (key, value) VALUES ($1, $2)
 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value";

/// Relational backend on PostgreSQL via a connection pool.
pub struct PostgresBackend {
  pool: Pool,
}

impl PostgresBackend {
  pub fn new(url: &str, max_connections: usize) -> Result<Self, anyhow::Error> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(max_connections.max(1)));
    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
    Ok(Self { pool })
  }
}

#[async_trait]
impl Backend for PostgresBackend {
  async fn init(&self) -> Result<(), anyhow::Error> {
    self.pool.get().await?.batch_execute(SCHEMA).await?;
    tracing::info!("PostgreSQL schema initialized");
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
    let row = self
      .pool
      .get()
      .await?
      .query_opt("SELECT value FROM store WHERE key = $1", &[&key])
      .await?;
    Ok(row.map(|r| r.get(0)))
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
    self.pool.get().await?.execute(UPSERT, &[&key, &value]).await?;
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
    self
      .pool
      .get()
      .await?
      .execute("DELETE FROM store WHERE key = $1", &[&key])
      .await?;
    Ok(())
  }

  async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, anyhow::Error> {
    let like = glob_to_like(pattern);
    let client = self.pool.get().await?;

    let rows = match not_pattern.map(glob_to_like) {
      Some(not_like) => {
        client
          .query(
            "SELECT key FROM store WHERE key LIKE $1 AND key NOT LIKE $2 ORDER BY key",
            &[&like, &not_like],
          )
          .await?
      }
      None => {
        client
          .query("SELECT key FROM store WHERE key LIKE $1 ORDER BY key", &[&like])
          .await?
      }
    };

    Ok(rows.iter().map(|r| r.get(0)).collect())
  }

  async fn do_bulk(&self, ops: &[BulkOp]) -> Result<(), anyhow::Error> {
    if ops.is_empty() {
      return Ok(());
    }
    let mut client = self.pool.get().await?;
    let tx = client.transaction().await?;
    for op in ops {
      match op {
        BulkOp::Set { key, value } => {
          tx.execute(UPSERT, &[key, value]).await?;
        }
        BulkOp::Remove { key } => {
          tx.execute("DELETE FROM store WHERE key = $1", &[key]).await?;
        }
      }
    }
    tx.commit().await?;
    Ok(())
  }

  async fn close(&self) -> Result<(), anyhow::Error> {
    self.pool.close();
    tracing::debug!("PostgreSQL pool closed");
    Ok(())
  }

  fn max_key_len(&self) -> Option<usize> {
    Some(MAX_KEY_LEN)
  }
}
