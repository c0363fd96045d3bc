//! Per-attribute change observers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by `observe`, used to stop observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

struct Entry {
  id: ObserverId,
  attribute: String,
  callback: Callback,
}

/// Observer list shared by records and projections.
///
/// Callbacks run after the list lock is released, so a callback may read or
/// write the cache, or add and remove observers.
#[derive(Default)]
pub(crate) struct Observers {
  next_id: AtomicU64,
  entries: Mutex<Vec<Entry>>,
}

impl Observers {
  pub fn add<F>(&self, attribute: &str, callback: F) -> ObserverId
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(Entry {
        id,
        attribute: attribute.to_string(),
        callback: Arc::new(callback),
      });
    id
  }

  pub fn remove(&self, id: ObserverId) -> bool {
    let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
    let before = entries.len();
    entries.retain(|e| e.id != id);
    entries.len() != before
  }

  pub fn clear(&self) {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }

  /// Fire every observer watching one of `attributes`, once per attribute.
  pub fn notify(&self, attributes: &[String]) {
    let fired: Vec<(String, Callback)> = {
      let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
      attributes
        .iter()
        .flat_map(|attribute| {
          entries
            .iter()
            .filter(move |e| &e.attribute == attribute)
            .map(move |e| (attribute.clone(), Arc::clone(&e.callback)))
        })
        .collect()
    };

    for (attribute, callback) in fired {
      callback(&attribute);
    }
  }
}
