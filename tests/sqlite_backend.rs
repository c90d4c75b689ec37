use hoarddb::db::{Backend, BulkOp, SqliteBackend};

#[tokio::test]
async fn test_sqlite_backend_init_schema() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();
  // Should not panic on re-init
  backend.init().await.unwrap();
}

#[tokio::test]
async fn test_sqlite_backend_set_and_get() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();

  backend.set("k", "{\"name\":\"Alice\"}").await.unwrap();
  assert_eq!(
    backend.get("k").await.unwrap(),
    Some("{\"name\":\"Alice\"}".to_string())
  );
  assert_eq!(backend.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_sqlite_backend_set_replaces() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();

  backend.set("k", "1").await.unwrap();
  backend.set("k", "2").await.unwrap();
  assert_eq!(backend.get("k").await.unwrap(), Some("2".to_string()));
}

#[tokio::test]
async fn test_sqlite_backend_remove() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();

  backend.set("k", "v").await.unwrap();
  backend.remove("k").await.unwrap();
  assert_eq!(backend.get("k").await.unwrap(), None);

  // Absence is not an error
  backend.remove("k").await.unwrap();
}

#[tokio::test]
async fn test_sqlite_backend_find_keys_glob() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();

  backend.set("pad:1", "a").await.unwrap();
  backend.set("pad:2", "b").await.unwrap();
  backend.set("pad:2:rev:0", "c").await.unwrap();
  backend.set("chat:1", "d").await.unwrap();

  let keys = backend.find_keys("pad:*", None).await.unwrap();
  assert_eq!(keys, ["pad:1", "pad:2", "pad:2:rev:0"]);

  let keys = backend.find_keys("pad:*", Some("pad:*:rev:*")).await.unwrap();
  assert_eq!(keys, ["pad:1", "pad:2"]);
}

#[tokio::test]
async fn test_sqlite_backend_find_keys_escapes_like_wildcards() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();

  backend.set("100%", "a").await.unwrap();
  backend.set("100x", "b").await.unwrap();
  backend.set("a_b", "c").await.unwrap();
  backend.set("axb", "d").await.unwrap();

  // Literal % and _ in the pattern must not behave as LIKE wildcards
  let keys = backend.find_keys("100%", None).await.unwrap();
  assert_eq!(keys, ["100%"]);

  let keys = backend.find_keys("a_b", None).await.unwrap();
  assert_eq!(keys, ["a_b"]);
}

#[tokio::test]
async fn test_sqlite_backend_do_bulk_order() {
  let backend = SqliteBackend::in_memory().await.unwrap();
  backend.init().await.unwrap();

  backend
    .do_bulk(&[
      BulkOp::Set {
        key: "a".into(),
        value: "1".into(),
      },
      BulkOp::Set {
        key: "b".into(),
        value: "2".into(),
      },
      BulkOp::Remove { key: "a".into() },
    ])
    .await
    .unwrap();

  assert_eq!(backend.get("a").await.unwrap(), None);
  assert_eq!(backend.get("b").await.unwrap(), Some("2".to_string()));
}

#[tokio::test]
async fn test_database_over_sqlite_survives_reopen() {
  use hoarddb::{CacheConfig, Database};
  use serde_json::json;
  use std::sync::Arc;

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let path = path.to_str().unwrap();

  {
    let backend = Arc::new(SqliteBackend::new(path).await.unwrap());
    let db = Database::new(backend, CacheConfig::default());
    db.init().await.unwrap();
    for i in 0..50 {
      db.set(&format!("key:{}", i), &json!({"n": i})).await.unwrap();
    }
    db.shutdown().await.unwrap();
  }

  let backend = Arc::new(SqliteBackend::new(path).await.unwrap());
  let db = Database::new(backend, CacheConfig::default());
  db.init().await.unwrap();
  for i in 0..50 {
    assert_eq!(
      db.get(&format!("key:{}", i)).await.unwrap(),
      Some(json!({"n": i}))
    );
  }
  let keys = db.find_keys("key:*", None).await.unwrap();
  assert_eq!(keys.len(), 50);
}

#[tokio::test]
async fn test_sqlite_backend_persists_across_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let path = path.to_str().unwrap();

  {
    let backend = SqliteBackend::new(path).await.unwrap();
    backend.init().await.unwrap();
    backend.set("k", "v").await.unwrap();
    backend.close().await.unwrap();
  }

  let backend = SqliteBackend::new(path).await.unwrap();
  backend.init().await.unwrap();
  assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
}
