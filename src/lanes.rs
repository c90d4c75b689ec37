//! Per-key operation serializer.
//!
//! Every façade call runs inside its key's lane: a fair async mutex that
//! admits waiters in arrival order. Operations on one key therefore execute
//! in submission order while different keys proceed in parallel. Lanes are
//! created on demand and removed once their last user departs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

type Lane = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct KeyLanes {
  lanes: Mutex<HashMap<String, Lane>>,
}

impl KeyLanes {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `fut` inside the key's lane.
  pub async fn run<T, F>(&self, key: &str, fut: F) -> T
  where
    F: Future<Output = T>,
  {
    let lane = {
      let mut lanes = self.lanes.lock();
      lanes
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
    };

    let out = {
      let _slot = lane.lock().await;
      fut.await
    };

    // GC: drop the lane when the map and this call hold the only clones.
    // A waiter that grabbed the lane between our unlock and this check
    // keeps the count above two and the lane stays.
    let mut lanes = self.lanes.lock();
    if let Some(current) = lanes.get(key) {
      if Arc::ptr_eq(current, &lane) && Arc::strong_count(current) == 2 {
        lanes.remove(key);
      }
    }
    out
  }

  /// Number of live lanes. Zero when no operations are in flight.
  pub fn lane_count(&self) -> usize {
    self.lanes.lock().len()
  }
}
