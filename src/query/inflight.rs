//! One in-flight request per key, shared by every caller that asks for it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use color_eyre::{Report, Result};
use futures::future::{BoxFuture, FutureExt, Shared};

pub(crate) type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, Arc<Report>>>>;

struct Pending<T> {
  token: u64,
  future: SharedFetch<T>,
}

type Registry<T> = Arc<Mutex<HashMap<String, Pending<T>>>>;

pub(crate) struct InFlight<T> {
  pending: Registry<T>,
  next_token: AtomicU64,
}

fn lock<T>(registry: &Registry<T>) -> MutexGuard<'_, HashMap<String, Pending<T>>> {
  registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone + Send + Sync + 'static> InFlight<T> {
  pub fn new() -> Self {
    Self {
      pending: Arc::new(Mutex::new(HashMap::new())),
      next_token: AtomicU64::new(0),
    }
  }

  /// Join the request pending under `key`, or start one with `start`.
  ///
  /// The request leaves the pending set when it settles, success or failure.
  /// `on_settle` runs at that point unless the entry was abandoned meanwhile.
  /// Returns the shared future and whether this call started it.
  pub fn join_or_start<F, Fut, S>(&self, key: &str, start: F, on_settle: S) -> (SharedFetch<T>, bool)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    S: FnOnce(&Result<T, Arc<Report>>) + Send + 'static,
  {
    let mut pending = lock(&self.pending);
    if let Some(existing) = pending.get(key) {
      return (existing.future.clone(), false);
    }

    let token = self.next_token.fetch_add(1, Ordering::Relaxed);
    let registry = Arc::clone(&self.pending);
    let owned_key = key.to_string();
    let fetch = start();

    let future = async move {
      let result = fetch.await.map_err(Arc::new);
      let current = {
        let mut pending = lock(&registry);
        match pending.get(&owned_key) {
          Some(entry) if entry.token == token => {
            pending.remove(&owned_key);
            true
          }
          _ => false,
        }
      };
      if current {
        on_settle(&result);
      }
      result
    }
    .boxed()
    .shared();

    pending.insert(
      key.to_string(),
      Pending {
        token,
        future: future.clone(),
      },
    );
    (future, true)
  }

  pub fn contains(&self, key: &str) -> bool {
    lock(&self.pending).contains_key(key)
  }

  /// Forget the pending request for `key`. Callers already waiting still get
  /// its result; the next call starts a new request.
  pub fn abandon(&self, key: &str) -> bool {
    lock(&self.pending).remove(key).is_some()
  }

  pub fn abandon_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
    let mut pending = lock(&self.pending);
    let before = pending.len();
    pending.retain(|key, _| !predicate(key));
    before - pending.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test]
  async fn test_concurrent_callers_share_one_request() {
    let in_flight = InFlight::<u32>::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let start = || {
      let calls = calls.clone();
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok(7)
      }
    };

    let (a, started_a) = in_flight.join_or_start("k", start(), |_| {});
    let (b, started_b) = in_flight.join_or_start("k", start(), |_| {});
    assert!(started_a);
    assert!(!started_b);
    assert!(in_flight.contains("k"));

    let (a, b) = futures::join!(a, b);
    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!in_flight.contains("k"));
  }

  #[tokio::test]
  async fn test_failure_leaves_pending_set() {
    let in_flight = InFlight::<u32>::new();
    let (future, _) = in_flight.join_or_start("k", || async { Err(eyre!("boom")) }, |_| {});

    assert!(future.await.is_err());
    assert!(!in_flight.contains("k"));

    let (future, started) = in_flight.join_or_start("k", || async { Ok(1) }, |_| {});
    assert!(started);
    assert_eq!(future.await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_abandoned_request_skips_settle() {
    let in_flight = InFlight::<u32>::new();
    let settled = Arc::new(AtomicUsize::new(0));
    let s = settled.clone();

    let (future, _) = in_flight.join_or_start(
      "k",
      || async { Ok(1) },
      move |_| {
        s.fetch_add(1, Ordering::SeqCst);
      },
    );
    assert!(in_flight.abandon("k"));

    assert_eq!(future.await.unwrap(), 1);
    assert_eq!(settled.load(Ordering::SeqCst), 0);
  }
}
