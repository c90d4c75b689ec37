//! Dirty write buffer and write-completion plumbing.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::db::BulkOp;
use crate::error::StoreError;

/// A buffered mutation in structured form, used to answer reads that land
/// between acceptance and flush.
pub(crate) enum PendingOp {
  Set(Value),
  Remove,
}

pub(crate) type WriteWaiter = oneshot::Sender<Result<(), StoreError>>;

/// One pending backend write: the latest operation for a key plus every
/// completion waiting on it.
pub(crate) struct PendingWrite {
  pub op: PendingOp,
  /// Pre-encoded backend form; encoding happens at acceptance time so
  /// unserializable values are rejected before they enter the buffer.
  pub wire: BulkOp,
  pub waiters: Vec<WriteWaiter>,
}

/// Insertion-ordered map of pending writes, at most one per key.
///
/// A second write to a buffered key replaces the operation in place and
/// keeps the key's original position, so cross-key submission order is what
/// the backend sees at flush time.
#[derive(Default)]
pub(crate) struct WriteBuffer {
  order: Vec<String>,
  ops: HashMap<String, PendingWrite>,
}

impl WriteBuffer {
  pub fn push(&mut self, key: &str, op: PendingOp, wire: BulkOp, waiter: WriteWaiter) {
    match self.ops.get_mut(key) {
      Some(existing) => {
        existing.op = op;
        existing.wire = wire;
        existing.waiters.push(waiter);
      }
      None => {
        self.order.push(key.to_string());
        self.ops.insert(
          key.to_string(),
          PendingWrite {
            op,
            wire,
            waiters: vec![waiter],
          },
        );
      }
    }
  }

  pub fn get(&self, key: &str) -> Option<&PendingWrite> {
    self.ops.get(key)
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  /// Buffered keys in insertion order.
  pub fn keys(&self) -> impl Iterator<Item = &String> {
    self.order.iter()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &PendingWrite)> {
    self.order.iter().filter_map(|k| self.ops.get(k).map(|p| (k, p)))
  }

  /// Detach the whole buffer, leaving this one empty.
  pub fn take(&mut self) -> WriteBuffer {
    std::mem::take(self)
  }

  /// Split into the ordered op batch, the keys it touches, and every
  /// completion waiting on the batch.
  pub fn into_parts(self) -> (Vec<BulkOp>, Vec<String>, Vec<WriteWaiter>) {
    let mut ops = Vec::with_capacity(self.order.len());
    let mut waiters = Vec::new();
    let mut map = self.ops;
    for key in &self.order {
      if let Some(pending) = map.remove(key) {
        ops.push(pending.wire);
        waiters.extend(pending.waiters);
      }
    }
    (ops, self.order, waiters)
  }
}

/// Handle to a write's durability outcome.
///
/// Returned as soon as the write is accepted into the buffer; awaiting
/// [`durable`](WriteReceipt::durable) resolves once the write has been
/// applied by the backend, or failed definitively.
#[derive(Debug)]
pub struct WriteReceipt {
  rx: oneshot::Receiver<Result<(), StoreError>>,
}

impl WriteReceipt {
  pub(crate) fn new(rx: oneshot::Receiver<Result<(), StoreError>>) -> Self {
    Self { rx }
  }

  pub async fn durable(self) -> Result<(), StoreError> {
    match self.rx.await {
      Ok(result) => result,
      // Sender dropped: the store was closed with the write still buffered.
      Err(_) => Err(StoreError::Shutdown),
    }
  }
}
