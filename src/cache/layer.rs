//! The cache-and-buffer layer: an LRU value cache, a dirty write buffer,
//! a pending-read deduper, and the periodic flusher that drains the buffer
//! through the backend's bulk path.
//!
//! All shared state lives behind one mutex that is never held across an
//! await point; backend I/O and the flusher timer are the only suspension
//! points.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use super::buffer::{PendingOp, WriteBuffer, WriteReceipt};
use crate::config::CacheConfig;
use crate::db::{glob_to_regex, Backend, BulkOp};
use crate::error::StoreError;

/// One cached value plus its bookkeeping bits.
struct CacheEntry {
  /// None is a tombstone: the key is known to be absent.
  value: Option<Value>,
  /// Locally mutated, not yet handed to the backend. A dirty entry always
  /// has a matching write buffer slot and is never evicted.
  dirty: bool,
  /// Part of an in-flight bulk write; pinned in the cache until it lands.
  writing: bool,
}

type ReadWaiter = oneshot::Sender<Result<Option<Value>, StoreError>>;

struct LayerState {
  entries: LruCache<String, CacheEntry>,
  /// Count of non-dirty entries; only these count against the cache cap.
  clean: usize,
  buffer: WriteBuffer,
  pending_reads: HashMap<String, Vec<ReadWaiter>>,
  closed: bool,
}

impl LayerState {
  fn new() -> Self {
    Self {
      entries: LruCache::unbounded(),
      clean: 0,
      buffer: WriteBuffer::default(),
      pending_reads: HashMap::new(),
      closed: false,
    }
  }

  /// Replace-or-create an entry as dirty and most-recently used.
  fn upsert_dirty(&mut self, key: &str, value: Option<Value>) {
    if let Some(entry) = self.entries.peek_mut(key) {
      if !entry.dirty {
        self.clean -= 1;
      }
      entry.value = value;
      entry.dirty = true;
      self.entries.promote(key);
    } else {
      self.entries.put(
        key.to_string(),
        CacheEntry {
          value,
          dirty: true,
          writing: false,
        },
      );
    }
  }

  /// Record a backend read result as a clean MRU entry. Skipped when the
  /// key already has an entry: a write that landed while the read was in
  /// flight must not be clobbered with the older backend state.
  fn populate_clean(&mut self, key: &str, value: Option<Value>) {
    if self.entries.contains(key) {
      return;
    }
    self.entries.put(
      key.to_string(),
      CacheEntry {
        value,
        dirty: false,
        writing: false,
      },
    );
    self.clean += 1;
  }

  /// Flip the detached buffer's entries from dirty to clean-but-writing.
  fn mark_detached(&mut self, detached: &WriteBuffer) {
    for key in detached.keys() {
      if let Some(entry) = self.entries.peek_mut(key) {
        if entry.dirty {
          entry.dirty = false;
          self.clean += 1;
        }
        entry.writing = true;
      }
    }
  }

  /// Unpin entries once their bulk write has completed (either way).
  /// An entry re-dirtied mid-flight stays dirty: its newer value is already
  /// sitting in the current buffer.
  fn finish_flush(&mut self, keys: &[String]) {
    for key in keys {
      if let Some(entry) = self.entries.peek_mut(key) {
        entry.writing = false;
      }
    }
  }

  /// Reclaim clean entries LRU-first once the cap is exceeded, down to
  /// `cap - min_gap` so eviction runs in batches rather than per insert.
  fn evict(&mut self, cap: usize, min_gap: usize) -> usize {
    if self.clean <= cap {
      return 0;
    }
    let target = cap.saturating_sub(min_gap);
    let mut victims = Vec::new();
    for (key, entry) in self.entries.iter().rev() {
      if self.clean - victims.len() <= target {
        break;
      }
      if !entry.dirty && !entry.writing {
        victims.push(key.clone());
      }
    }
    for key in &victims {
      self.entries.pop(key);
    }
    self.clean -= victims.len();
    victims.len()
  }
}

#[derive(Default)]
struct LayerCounters {
  hits: AtomicU64,
  misses: AtomicU64,
  evictions: AtomicU64,
  flushes: AtomicU64,
  flush_failures: AtomicU64,
}

/// Snapshot of cache layer statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub flushes: u64,
  pub flush_failures: u64,
  pub entries: usize,
  pub clean: usize,
  pub dirty: usize,
  pub buffered: usize,
  pub last_flush_at: Option<DateTime<Utc>>,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      self.hits as f64 / total as f64
    }
  }
}

struct Inner {
  backend: Arc<dyn Backend>,
  cfg: CacheConfig,
  state: Mutex<LayerState>,
  /// Serializes flush batches so two drains can never race each other on
  /// the backend and reorder a key's writes.
  flush_gate: tokio::sync::Mutex<()>,
  /// Wakes the flusher early; the sole wake source in write-through mode.
  kick: Notify,
  flusher: Mutex<Option<JoinHandle<()>>>,
  counters: LayerCounters,
  last_flush: Mutex<Option<DateTime<Utc>>>,
}

enum ReadPlan {
  Hit(Option<Value>),
  Join(oneshot::Receiver<Result<Option<Value>, StoreError>>),
  Fetch,
}

/// Cache-and-buffer layer over one backend.
///
/// Cheap to clone; clones share the same cache, buffer, and flusher.
#[derive(Clone)]
pub struct CacheLayer {
  inner: Arc<Inner>,
}

impl CacheLayer {
  pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
    Self {
      inner: Arc::new(Inner {
        backend,
        cfg: config,
        state: Mutex::new(LayerState::new()),
        flush_gate: tokio::sync::Mutex::new(()),
        kick: Notify::new(),
        flusher: Mutex::new(None),
        counters: LayerCounters::default(),
        last_flush: Mutex::new(None),
      }),
    }
  }

  /// Initialize the backend and start the periodic flusher.
  pub async fn init(&self) -> Result<(), StoreError> {
    self
      .inner
      .backend
      .init()
      .await
      .map_err(StoreError::backend)?;
    self.start_flusher();
    Ok(())
  }

  pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
    self.inner.get(key).await
  }

  /// Accept a write into the buffer. The returned receipt resolves when the
  /// value has been flushed to the backend.
  pub async fn set(&self, key: &str, value: Value) -> Result<WriteReceipt, StoreError> {
    let wire = self.inner.encode(&value)?;
    let (tx, rx) = oneshot::channel();
    {
      let mut st = self.inner.state.lock();
      if st.closed {
        return Err(StoreError::Shutdown);
      }
      st.upsert_dirty(key, Some(value.clone()));
      st.buffer.push(
        key,
        PendingOp::Set(value),
        BulkOp::Set {
          key: key.to_string(),
          value: wire,
        },
        tx,
      );
    }
    if self.inner.cfg.write_interval_ms == 0 {
      self.inner.kick.notify_one();
    }
    Ok(WriteReceipt::new(rx))
  }

  /// Buffer a removal. Leaves a tombstone in the cache so reads answer
  /// "known absent" without touching the backend.
  pub async fn remove(&self, key: &str) -> Result<WriteReceipt, StoreError> {
    let (tx, rx) = oneshot::channel();
    {
      let mut st = self.inner.state.lock();
      if st.closed {
        return Err(StoreError::Shutdown);
      }
      st.upsert_dirty(key, None);
      st.buffer.push(
        key,
        PendingOp::Remove,
        BulkOp::Remove {
          key: key.to_string(),
        },
        tx,
      );
    }
    if self.inner.cfg.write_interval_ms == 0 {
      self.inner.kick.notify_one();
    }
    Ok(WriteReceipt::new(rx))
  }

  /// Backend key query with the in-memory buffer state overlaid: buffered
  /// sets are added, buffered removes subtracted. The result reflects the
  /// buffer+backend snapshot at execution time.
  pub async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, StoreError> {
    self.inner.find_keys(pattern, not_pattern).await
  }

  /// Drain the write buffer now, regardless of the flush interval.
  pub async fn flush(&self) -> Result<(), StoreError> {
    self.inner.flush_once().await.map(|_| ())
  }

  /// Flush every buffered write to completion, then stop the flusher.
  /// Operations submitted afterwards fail with [`StoreError::Shutdown`].
  pub async fn shutdown(&self) -> Result<(), StoreError> {
    {
      let mut st = self.inner.state.lock();
      if st.closed {
        return Err(StoreError::Shutdown);
      }
      st.closed = true;
    }
    let mut result = Ok(());
    loop {
      match self.inner.flush_once().await {
        Ok(true) => continue,
        Ok(false) => break,
        Err(e) => {
          result = Err(e);
          break;
        }
      }
    }
    self.stop_flusher();
    tracing::info!("cache layer shut down");
    result
  }

  /// Stop the flusher without flushing and close the backend. Buffered
  /// writes are dropped; their receipts resolve with a shutdown error.
  pub async fn close(&self) -> Result<(), StoreError> {
    {
      let mut st = self.inner.state.lock();
      st.closed = true;
      let dropped = st.buffer.take();
      if !dropped.is_empty() {
        tracing::warn!(ops = dropped.len(), "closing with unflushed writes");
      }
      st.pending_reads.clear();
    }
    self.stop_flusher();
    self
      .inner
      .backend
      .close()
      .await
      .map_err(StoreError::backend)
  }

  pub fn stats(&self) -> CacheStats {
    let (entries, clean, buffered) = {
      let st = self.inner.state.lock();
      (st.entries.len(), st.clean, st.buffer.len())
    };
    let c = &self.inner.counters;
    CacheStats {
      hits: c.hits.load(Ordering::Relaxed),
      misses: c.misses.load(Ordering::Relaxed),
      evictions: c.evictions.load(Ordering::Relaxed),
      flushes: c.flushes.load(Ordering::Relaxed),
      flush_failures: c.flush_failures.load(Ordering::Relaxed),
      entries,
      clean,
      dirty: entries - clean,
      buffered,
      last_flush_at: *self.inner.last_flush.lock(),
    }
  }

  fn start_flusher(&self) {
    let mut slot = self.inner.flusher.lock();
    if slot.is_some() {
      return;
    }
    let inner = Arc::clone(&self.inner);
    let interval = inner.cfg.write_interval_ms;
    *slot = Some(tokio::spawn(async move {
      loop {
        if interval == 0 {
          inner.kick.notified().await;
        } else {
          tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(interval)) => {}
            _ = inner.kick.notified() => {}
          }
        }
        if inner.state.lock().closed {
          break;
        }
        // Failures are reported through the write receipts; nothing to do
        // here but keep ticking.
        let _ = inner.flush_once().await;
      }
    }));
    tracing::debug!(interval_ms = interval, "write flusher started");
  }

  fn stop_flusher(&self) {
    if let Some(handle) = self.inner.flusher.lock().take() {
      handle.abort();
    }
  }
}

impl Inner {
  async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
    let plan = {
      let mut st = self.state.lock();
      if st.closed {
        return Err(StoreError::Shutdown);
      }
      if let Some(entry) = st.entries.get(key) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        ReadPlan::Hit(entry.value.clone())
      } else {
        let buffered = st.buffer.get(key).map(|pending| match &pending.op {
          PendingOp::Set(v) => Some(v.clone()),
          PendingOp::Remove => None,
        });
        match buffered {
          Some(value) => {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            if value.is_some() {
              st.upsert_dirty(key, value.clone());
            }
            ReadPlan::Hit(value)
          }
          None => {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if let Some(waiters) = st.pending_reads.get_mut(key) {
              let (tx, rx) = oneshot::channel();
              waiters.push(tx);
              ReadPlan::Join(rx)
            } else {
              st.pending_reads.insert(key.to_string(), Vec::new());
              ReadPlan::Fetch
            }
          }
        }
      }
    };

    match plan {
      ReadPlan::Hit(value) => Ok(value),
      ReadPlan::Join(rx) => match rx.await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Shutdown),
      },
      ReadPlan::Fetch => {
        let result = self.backend_get(key).await;
        let waiters = {
          let mut st = self.state.lock();
          let waiters = st.pending_reads.remove(key).unwrap_or_default();
          if let Ok(value) = &result {
            st.populate_clean(key, value.clone());
            let evicted = st.evict(self.cfg.cache, self.cfg.min_gap());
            if evicted > 0 {
              self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
              tracing::debug!(evicted, "evicted clean cache entries");
            }
          }
          waiters
        };
        for waiter in waiters {
          let _ = waiter.send(result.clone());
        }
        result
      }
    }
  }

  async fn backend_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
    let raw = with_timeout(self.cfg.op_timeout_ms, self.backend.get(key)).await?;
    match raw {
      Some(s) => Ok(Some(self.decode(&s)?)),
      None => Ok(None),
    }
  }

  async fn find_keys(
    &self,
    pattern: &str,
    not_pattern: Option<&str>,
  ) -> Result<Vec<String>, StoreError> {
    if self.state.lock().closed {
      return Err(StoreError::Shutdown);
    }
    let mut keys =
      with_timeout(self.cfg.op_timeout_ms, self.backend.find_keys(pattern, not_pattern)).await?;

    let re = glob_to_regex(pattern);
    let not_re = not_pattern.map(glob_to_regex);
    let matches =
      |k: &str| re.is_match(k) && not_re.as_ref().map(|r| !r.is_match(k)).unwrap_or(true);

    let (added, removed) = {
      let st = self.state.lock();
      let mut added = Vec::new();
      let mut removed = HashSet::new();
      for (key, pending) in st.buffer.iter() {
        if !matches(key) {
          continue;
        }
        match &pending.op {
          PendingOp::Set(_) => added.push(key.clone()),
          PendingOp::Remove => {
            removed.insert(key.clone());
          }
        }
      }
      (added, removed)
    };

    keys.retain(|k| !removed.contains(k));
    for key in added {
      if !keys.contains(&key) {
        keys.push(key);
      }
    }
    keys.sort();
    Ok(keys)
  }

  /// Drain one detached batch through the backend. Returns false when the
  /// buffer was already empty.
  async fn flush_once(&self) -> Result<bool, StoreError> {
    let _gate = self.flush_gate.lock().await;

    let detached = {
      let mut st = self.state.lock();
      if st.buffer.is_empty() {
        return Ok(false);
      }
      let detached = st.buffer.take();
      st.mark_detached(&detached);
      detached
    };

    let (ops, keys, waiters) = detached.into_parts();
    tracing::debug!(ops = ops.len(), "flushing write buffer");

    let mut result = self.call_bulk(&ops).await;
    let mut attempt = 0u32;
    while result.is_err() && attempt < self.cfg.flush_retries {
      let backoff = self
        .cfg
        .flush_retry_backoff_ms
        .saturating_mul(1u64 << attempt.min(16));
      tokio::time::sleep(Duration::from_millis(backoff)).await;
      attempt += 1;
      tracing::warn!(attempt, "retrying failed flush batch");
      result = self.call_bulk(&ops).await;
    }

    {
      let mut st = self.state.lock();
      st.finish_flush(&keys);
      let evicted = st.evict(self.cfg.cache, self.cfg.min_gap());
      if evicted > 0 {
        self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
      }
    }

    match &result {
      Ok(()) => {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        *self.last_flush.lock() = Some(Utc::now());
        for waiter in waiters {
          let _ = waiter.send(Ok(()));
        }
      }
      Err(e) => {
        self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %e, ops = keys.len(), "flush failed; reporting to writers");
        for waiter in waiters {
          let _ = waiter.send(Err(e.clone()));
        }
      }
    }

    result.map(|_| true)
  }

  async fn call_bulk(&self, ops: &[BulkOp]) -> Result<(), StoreError> {
    with_timeout(self.cfg.op_timeout_ms, self.backend.do_bulk(ops)).await
  }

  fn encode(&self, value: &Value) -> Result<String, StoreError> {
    if self.cfg.json {
      serde_json::to_string(value).map_err(|e| StoreError::InvalidValue(e.to_string()))
    } else {
      match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(StoreError::InvalidValue(
          "JSON encoding is disabled; value must be a string".into(),
        )),
      }
    }
  }

  fn decode(&self, raw: &str) -> Result<Value, StoreError> {
    if self.cfg.json {
      serde_json::from_str(raw)
        .map_err(|e| StoreError::InvalidValue(format!("undecodable value from backend: {}", e)))
    } else {
      Ok(Value::String(raw.to_string()))
    }
  }
}

async fn with_timeout<T>(
  ms: u64,
  fut: impl Future<Output = Result<T, anyhow::Error>>,
) -> Result<T, StoreError> {
  if ms == 0 {
    return fut.await.map_err(StoreError::backend);
  }
  match tokio::time::timeout(Duration::from_millis(ms), fut).await {
    Ok(result) => result.map_err(StoreError::backend),
    Err(_) => Err(StoreError::backend(anyhow::anyhow!(
      "backend call timed out after {} ms",
      ms
    ))),
  }
}
