use std::sync::Arc;

use thiserror::Error;

/// Error type for all store operations.
///
/// `Clone` so a single failed flush can be reported to every write that was
/// coalesced into the batch.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
  /// The key exceeds the length limit declared by the active backend.
  /// Raised before the write enters the buffer.
  #[error("key {key:?} exceeds the backend key length limit of {max} bytes")]
  KeyTooLong { key: String, max: usize },

  /// Any failure reported by the backend: connectivity, constraint, timeout.
  #[error("backend error: {0}")]
  Backend(Arc<anyhow::Error>),

  /// A sub-value write tried to descend through a value that is not an
  /// object. `path` is the dotted prefix naming the offending value.
  #[error("cannot write through non-object value at {path:?}")]
  NotAnObject { path: String },

  /// The value cannot cross the backend boundary: serialization failed, or
  /// JSON encoding is disabled and the value is not a string.
  #[error("invalid value: {0}")]
  InvalidValue(String),

  /// The store has been shut down or closed.
  #[error("store is shut down")]
  Shutdown,
}

impl StoreError {
  pub fn backend(err: anyhow::Error) -> Self {
    StoreError::Backend(Arc::new(err))
  }

  pub fn is_backend(&self) -> bool {
    matches!(self, StoreError::Backend(_))
  }
}
