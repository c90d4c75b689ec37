use std::io::Write;

use hoarddb::{BackendType, CacheConfig, StoreConfig};

#[test]
fn test_defaults() {
  let cfg = CacheConfig::default();
  assert_eq!(cfg.cache, 1000);
  assert_eq!(cfg.write_interval_ms, 100);
  assert!(cfg.json);
  assert_eq!(cfg.op_timeout_ms, 60_000);
  assert_eq!(cfg.flush_retries, 0);
  assert_eq!(cfg.min_gap(), 100);
}

#[test]
fn test_min_gap_floor() {
  let cfg = CacheConfig {
    cache: 5,
    ..CacheConfig::default()
  };
  assert_eq!(cfg.min_gap(), 1);

  let cfg = CacheConfig {
    cache_min_gap: Some(25),
    ..CacheConfig::default()
  };
  assert_eq!(cfg.min_gap(), 25);
}

#[test]
fn test_parse_yaml_sections() {
  let yaml = r#"
backend: memory
cache:
  cache: 50
  write_interval_ms: 0
  json: false
"#;
  let cfg: StoreConfig = serde_yaml::from_str(yaml).unwrap();
  assert_eq!(cfg.backend, BackendType::Memory);
  assert_eq!(cfg.cache.cache, 50);
  assert_eq!(cfg.cache.write_interval_ms, 0);
  assert!(!cfg.cache.json);
  // Untouched sections keep their defaults
  assert_eq!(cfg.sqlite.path, "hoarddb.db");
  assert_eq!(cfg.postgres.max_connections, 20);
}

#[test]
fn test_from_file_expands_env_vars() {
  std::env::set_var("HOARDDB_TEST_DATA_DIR", "/tmp/hoard-test");

  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(file, "backend: sqlite").unwrap();
  writeln!(file, "sqlite:").unwrap();
  writeln!(file, "  path: ${{HOARDDB_TEST_DATA_DIR}}/store.db").unwrap();
  file.flush().unwrap();

  let cfg = StoreConfig::from_file(file.path()).unwrap();
  assert_eq!(cfg.backend, BackendType::Sqlite);
  assert_eq!(cfg.sqlite.path, "/tmp/hoard-test/store.db");
}

#[tokio::test]
async fn test_open_memory_backend() {
  let cfg = StoreConfig {
    backend: BackendType::Memory,
    ..StoreConfig::default()
  };
  let backend = cfg.open_backend().await.unwrap();
  backend.init().await.unwrap();
  backend.set("k", "v").await.unwrap();
  assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
}
