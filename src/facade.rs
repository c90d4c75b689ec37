//! Public façade: validates keys, deep-clones values at the boundary, and
//! routes every call through the per-key lanes so same-key operations
//! complete in submission order.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::cache::{CacheLayer, CacheStats, WriteReceipt};
use crate::config::{CacheConfig, StoreConfig};
use crate::db::Backend;
use crate::error::StoreError;
use crate::lanes::KeyLanes;

pub struct Database {
  backend: Arc<dyn Backend>,
  cache: CacheLayer,
  lanes: KeyLanes,
}

impl Database {
  pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
    Self {
      cache: CacheLayer::new(Arc::clone(&backend), config),
      backend,
      lanes: KeyLanes::new(),
    }
  }

  /// Open the backend named by `config` and wrap it.
  pub async fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
    let backend = config.open_backend().await.map_err(StoreError::backend)?;
    Ok(Self::new(backend, config.cache.clone()))
  }

  /// Initialize the backend and start the write flusher. Call once before
  /// the first operation.
  pub async fn init(&self) -> Result<(), StoreError> {
    self.cache.init().await
  }

  /// Fetch the value under `key`, or None if absent. The caller owns the
  /// returned value; mutating it does not affect the cache.
  pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
    self.lanes.run(key, self.cache.get(key)).await
  }

  /// Store a deep copy of `value` under `key`. Returns once the write is
  /// buffered; await the receipt for durability.
  pub async fn set(&self, key: &str, value: &Value) -> Result<WriteReceipt, StoreError> {
    self.check_key(key)?;
    let value = value.clone();
    self.lanes.run(key, self.cache.set(key, value)).await
  }

  /// Remove `key`. Subsequent reads observe the removal immediately.
  pub async fn remove(&self, key: &str) -> Result<WriteReceipt, StoreError> {
    self.lanes.run(key, self.cache.remove(key)).await
  }

  /// All keys matching glob `pattern` (and not matching `not_pattern`),
  /// with unflushed writes overlaid onto the backend's answer.
  pub async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, StoreError> {
    self.cache.find_keys(pattern, not_pattern).await
  }

  /// Fetch the sub-value at `path` inside the value under `key`. Returns
  /// None when the key or any intermediate component is absent.
  pub async fn get_sub<S>(&self, key: &str, path: &[S]) -> Result<Option<Value>, StoreError>
  where
    S: AsRef<str> + Sync,
  {
    self
      .lanes
      .run(key, async move {
        let Some(root) = self.cache.get(key).await? else {
          return Ok(None);
        };
        Ok(lookup_path(&root, path).cloned())
      })
      .await
  }

  /// Write `value` at `path` inside the value under `key`, creating missing
  /// intermediate objects. The read-modify-write runs inside one lane slot,
  /// so concurrent writers on the same key observe pre- or post-state,
  /// never an interleaving. An empty path replaces the whole value.
  pub async fn set_sub<S>(
    &self,
    key: &str,
    path: &[S],
    value: &Value,
  ) -> Result<WriteReceipt, StoreError>
  where
    S: AsRef<str> + Sync,
  {
    self.check_key(key)?;
    let value = value.clone();
    self
      .lanes
      .run(key, async move {
        if path.is_empty() {
          return self.cache.set(key, value).await;
        }
        let current = self.cache.get(key).await?;
        let mut root = current.unwrap_or_else(|| Value::Object(Map::new()));
        write_path(&mut root, path, value)?;
        self.cache.set(key, root).await
      })
      .await
  }

  /// Drain the write buffer now.
  pub async fn flush(&self) -> Result<(), StoreError> {
    self.cache.flush().await
  }

  /// Flush everything, then stop accepting operations.
  pub async fn shutdown(&self) -> Result<(), StoreError> {
    self.cache.shutdown().await
  }

  /// Stop without flushing and close the backend.
  pub async fn close(&self) -> Result<(), StoreError> {
    self.cache.close().await
  }

  pub fn stats(&self) -> CacheStats {
    self.cache.stats()
  }

  fn check_key(&self, key: &str) -> Result<(), StoreError> {
    if let Some(max) = self.backend.max_key_len() {
      if key.len() > max {
        return Err(StoreError::KeyTooLong {
          key: key.to_string(),
          max,
        });
      }
    }
    Ok(())
  }
}

fn lookup_path<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
  let mut cur = root;
  for seg in path {
    cur = cur.as_object()?.get(seg.as_ref())?;
  }
  Some(cur)
}

fn write_path<S: AsRef<str>>(root: &mut Value, path: &[S], value: Value) -> Result<(), StoreError> {
  let Some((leaf, parents)) = path.split_last() else {
    *root = value;
    return Ok(());
  };

  let mut walked: Vec<String> = Vec::with_capacity(parents.len());
  let mut cur = root;
  for seg in parents {
    let seg = seg.as_ref();
    let map = match cur {
      Value::Object(map) => map,
      _ => {
        return Err(StoreError::NotAnObject {
          path: walked.join("."),
        })
      }
    };
    cur = map
      .entry(seg.to_string())
      .or_insert_with(|| Value::Object(Map::new()));
    walked.push(seg.to_string());
  }

  match cur {
    Value::Object(map) => {
      map.insert(leaf.as_ref().to_string(), value);
      Ok(())
    }
    _ => Err(StoreError::NotAnObject {
      path: walked.join("."),
    }),
  }
}
