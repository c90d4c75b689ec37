use async_trait::async_trait;
use rusqlite::params;
use tokio_rusqlite::Connection;

use super::backend::{glob_to_like, Backend, BulkOp};

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA page_size = 4096;
"#;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Embedded backend on a local SQLite file.
pub struct SqliteBackend {
  conn: Connection,
}

impl SqliteBackend {
  pub async fn new(path: &str) -> Result<Self, anyhow::Error> {
    let conn = if path == ":memory:" {
      Connection::open_in_memory().await?
    } else {
      Connection::open(path).await?
    };

    // Apply performance pragmas
    conn
      .call(|conn| conn.execute_batch(PRAGMAS).map_err(|e| e.into()))
      .await?;

    Ok(Self { conn })
  }

  pub async fn in_memory() -> Result<Self, anyhow::Error> {
    Self::new(":memory:").await
  }
}

#[async_trait]
impl Backend for SqliteBackend {
  async fn init(&self) -> Result<(), anyhow::Error> {
    self
      .conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    tracing::info!("SQLite schema initialized");
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
    let key = key.to_string();
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached("SELECT value FROM store WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
          Ok(Some(row.get(0)?))
        } else {
          Ok(None)
        }
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
    let key = key.to_string();
    let value = value.to_string();
    self
      .conn
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
          )
          .map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
    let key = key.to_string();
    self
      .conn
      .call(move |conn| {
        conn
          .execute("DELETE FROM store WHERE key = ?1", params![key])
          .map_err(|e| e.into())
      })
      .await?;
    Ok(())
  }

  async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, anyhow::Error> {
    let like = glob_to_like(pattern);
    let not_like = not_pattern.map(glob_to_like);

    self
      .conn
      .call(move |conn| {
        let mut sql = String::from("SELECT key FROM store WHERE key LIKE ?1 ESCAPE '\\'");
        if not_like.is_some() {
          sql.push_str(" AND key NOT LIKE ?2 ESCAPE '\\'");
        }
        sql.push_str(" ORDER BY key");

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = match &not_like {
          Some(n) => stmt.query(params![like, n])?,
          None => stmt.query(params![like])?,
        };
        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
          keys.push(row.get(0)?);
        }
        Ok(keys)
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn do_bulk(&self, ops: &[BulkOp]) -> Result<(), anyhow::Error> {
    if ops.is_empty() {
      return Ok(());
    }
    let ops = ops.to_vec();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        for op in &ops {
          match op {
            BulkOp::Set { key, value } => {
              tx.execute(
                "INSERT INTO store (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
              )?;
            }
            BulkOp::Remove { key } => {
              tx.execute("DELETE FROM store WHERE key = ?1", params![key])?;
            }
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(|e| anyhow::anyhow!("{}", e))
  }

  async fn close(&self) -> Result<(), anyhow::Error> {
    // The connection task shuts down when the last handle drops; nothing to
    // tear down eagerly beyond flushing WAL, which SQLite does on close.
    tracing::debug!("SQLite backend closed");
    Ok(())
  }
}
