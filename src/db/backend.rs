use async_trait::async_trait;

/// One operation of a bulk write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkOp {
  Set { key: String, value: String },
  Remove { key: String },
}

impl BulkOp {
  pub fn key(&self) -> &str {
    match self {
      BulkOp::Set { key, .. } => key,
      BulkOp::Remove { key } => key,
    }
  }
}

/// Abstract storage backend.
///
/// Values cross this boundary in wire form (a string); the cache layer above
/// decides whether that string is JSON text or a raw payload. Keys are plain
/// strings. A backend that caps key length declares it via `max_key_len` so
/// oversized keys are rejected before they are buffered.
#[async_trait]
pub trait Backend: Send + Sync {
  /// Prepare storage. Idempotent: safe to call on an initialized store.
  async fn init(&self) -> Result<(), anyhow::Error>;

  /// Fetch the value stored under `key`, or None if absent.
  async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;

  /// Insert-or-replace.
  async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error>;

  /// Delete if present; absence is not an error.
  async fn remove(&self, key: &str) -> Result<(), anyhow::Error>;

  /// Return all keys matching glob `pattern` and, if supplied, NOT matching
  /// `not_pattern`. `*` matches any run of characters.
  async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, anyhow::Error>;

  /// Apply a batch of operations in submission order. Each operation is
  /// atomic on its own; the batch as a whole need not be transactional.
  async fn do_bulk(&self, ops: &[BulkOp]) -> Result<(), anyhow::Error>;

  /// Release resources.
  async fn close(&self) -> Result<(), anyhow::Error>;

  /// Declared maximum key length in bytes, if the backend has one.
  fn max_key_len(&self) -> Option<usize> {
    None
  }
}

/// Convert a glob pattern to a regex matching the whole input.
/// Only `*` is special; every other character matches literally.
pub fn glob_to_regex(pattern: &str) -> regex::Regex {
  let mut regex_str = String::with_capacity(pattern.len() * 2);
  regex_str.push('^');

  for c in pattern.chars() {
    match c {
      '*' => regex_str.push_str(".*"),
      '.' | '?' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\' => {
        regex_str.push('\\');
        regex_str.push(c);
      }
      _ => regex_str.push(c),
    }
  }

  regex_str.push('$');
  regex::Regex::new(&regex_str).unwrap_or_else(|_| regex::Regex::new("^$").unwrap())
}

/// Translate a glob pattern to a SQL LIKE pattern with `\` as the escape
/// character: `*` becomes `%`, literal `%`/`_`/`\` are escaped.
pub fn glob_to_like(pattern: &str) -> String {
  let mut like = String::with_capacity(pattern.len() + 4);
  for c in pattern.chars() {
    match c {
      '*' => like.push('%'),
      '%' | '_' | '\\' => {
        like.push('\\');
        like.push(c);
      }
      _ => like.push(c),
    }
  }
  like
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_glob_matches_runs() {
    let re = glob_to_regex("pad:*");
    assert!(re.is_match("pad:1"));
    assert!(re.is_match("pad:"));
    assert!(re.is_match("pad:a:b"));
    assert!(!re.is_match("chat:1"));
  }

  #[test]
  fn test_glob_escapes_regex_metachars() {
    let re = glob_to_regex("a.b+c");
    assert!(re.is_match("a.b+c"));
    assert!(!re.is_match("aXb+c"));
  }

  #[test]
  fn test_glob_interior_star() {
    let re = glob_to_regex("*:revs:*");
    assert!(re.is_match("pad:revs:0"));
    assert!(!re.is_match("pad:meta"));
  }

  #[test]
  fn test_glob_to_like_translation() {
    assert_eq!(glob_to_like("pad:*"), "pad:%");
    assert_eq!(glob_to_like("100%_*"), "100\\%\\_%");
    assert_eq!(glob_to_like("a\\b"), "a\\\\b");
  }
}
