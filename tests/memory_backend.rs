use hoarddb::db::{Backend, BulkOp, MemoryBackend};

#[tokio::test]
async fn test_memory_backend_set_and_get() {
  let backend = MemoryBackend::new();
  backend.init().await.unwrap();

  backend.set("k", "v").await.unwrap();
  assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
  assert_eq!(backend.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_memory_backend_remove() {
  let backend = MemoryBackend::new();
  backend.set("k", "v").await.unwrap();

  backend.remove("k").await.unwrap();
  assert_eq!(backend.get("k").await.unwrap(), None);

  // Removing an absent key is not an error
  backend.remove("k").await.unwrap();
}

#[tokio::test]
async fn test_memory_backend_find_keys() {
  let backend = MemoryBackend::new();
  backend.set("pad:1", "a").await.unwrap();
  backend.set("pad:2", "b").await.unwrap();
  backend.set("pad:2:rev:0", "c").await.unwrap();
  backend.set("chat:1", "d").await.unwrap();

  let keys = backend.find_keys("pad:*", None).await.unwrap();
  assert_eq!(keys, ["pad:1", "pad:2", "pad:2:rev:0"]);

  let keys = backend.find_keys("pad:*", Some("pad:*:rev:*")).await.unwrap();
  assert_eq!(keys, ["pad:1", "pad:2"]);

  let keys = backend.find_keys("*", None).await.unwrap();
  assert_eq!(keys.len(), 4);
}

#[tokio::test]
async fn test_memory_backend_do_bulk_applies_in_order() {
  let backend = MemoryBackend::new();
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
async fn test_memory_backend_no_key_cap() {
  let backend = MemoryBackend::new();
  assert_eq!(backend.max_key_len(), None);
}
