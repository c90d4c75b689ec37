use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::backend::{glob_to_regex, Backend, BulkOp};

/// In-memory backend. Baseline implementation for tests and ephemeral
/// deployments; linear-scan `find_keys`.
#[derive(Default)]
pub struct MemoryBackend {
  data: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of stored keys.
  pub fn len(&self) -> usize {
    self.data.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.read().is_empty()
  }
}

#[async_trait]
impl Backend for MemoryBackend {
  async fn init(&self) -> Result<(), anyhow::Error> {
    Ok(())
  }

  async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
    Ok(self.data.read().get(key).cloned())
  }

  async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
    self.data.write().insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
    self.data.write().remove(key);
    Ok(())
  }

  async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, anyhow::Error> {
    let re = glob_to_regex(pattern);
    let not_re = not_pattern.map(glob_to_regex);
    let data = self.data.read();
    let mut keys: Vec<String> = data
      .keys()
      .filter(|k| re.is_match(k))
      .filter(|k| not_re.as_ref().map(|r| !r.is_match(k)).unwrap_or(true))
      .cloned()
      .collect();
    keys.sort();
    Ok(keys)
  }

  async fn do_bulk(&self, ops: &[BulkOp]) -> Result<(), anyhow::Error> {
    let mut data = self.data.write();
    for op in ops {
      match op {
        BulkOp::Set { key, value } => {
          data.insert(key.clone(), value.clone());
        }
        BulkOp::Remove { key } => {
          data.remove(key);
        }
      }
    }
    Ok(())
  }

  async fn close(&self) -> Result<(), anyhow::Error> {
    Ok(())
  }
}
