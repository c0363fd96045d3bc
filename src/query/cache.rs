//! Query cache that sits between callers and the adapter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use tracing::debug;

use super::inflight::InFlight;
use super::key::{QueryKey, QueryOptions};
use crate::error::StoreError;

/// Result of a query, including metadata about where it came from.
#[derive(Debug, Clone)]
pub struct QueryResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

/// Indicates where a query result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This call issued the request
  Network,
  /// This call joined a request another caller had already issued
  InFlight,
  /// Served from the cache without a request
  Cache,
}

struct Loaded<T> {
  data: T,
  cached_at: DateTime<Utc>,
}

type LoadedMap<T> = Arc<Mutex<HashMap<String, Loaded<T>>>>;

/// Caches query results by key, with at most one request per key in flight.
pub struct QueryCache<T> {
  loaded: LoadedMap<T>,
  in_flight: Arc<InFlight<T>>,
  /// How long before a loaded result is fetched again; `None` keeps it until unloaded
  stale_time: Option<Duration>,
}

impl<T: Clone + Send + Sync + 'static> QueryCache<T> {
  pub fn new() -> Self {
    Self {
      loaded: Arc::new(Mutex::new(HashMap::new())),
      in_flight: Arc::new(InFlight::new()),
      stale_time: None,
    }
  }

  /// Set the stale time for loaded results.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  fn loaded(&self) -> MutexGuard<'_, HashMap<String, Loaded<T>>> {
    self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Check if loaded data is stale based on its cached_at timestamp.
  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    self
      .stale_time
      .is_some_and(|stale_time| Utc::now() - cached_at > stale_time)
  }

  /// Run a URL query through the cache.
  ///
  /// 1. Unless `reload` is set, return a loaded, fresh result immediately
  /// 2. Join the request already in flight for the key, if any
  /// 3. Otherwise call `fetcher` and cache its successful result
  pub async fn query_url<F, Fut>(
    &self,
    url: &str,
    options: &QueryOptions,
    fetcher: F,
  ) -> Result<QueryResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = QueryKey::new(url, options);
    debug!(query = %key.description(), "query");
    self.fetch(&key.cache_key(), options.reload, fetcher).await
  }

  /// Fetch by precomputed cache key.
  pub async fn fetch<F, Fut>(&self, key: &str, reload: bool, fetcher: F) -> Result<QueryResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if !reload {
      if let Some(loaded) = self.loaded().get(key) {
        if !self.is_stale(loaded.cached_at) {
          debug!(key, "query cache hit");
          return Ok(QueryResult {
            data: loaded.data.clone(),
            source: CacheSource::Cache,
            cached_at: Some(loaded.cached_at),
          });
        }
      }
    }

    let loaded = Arc::clone(&self.loaded);
    let owned_key = key.to_string();
    let (future, started) = self.in_flight.join_or_start(key, fetcher, move |result| {
      if let Ok(data) = result {
        loaded.lock().unwrap_or_else(PoisonError::into_inner).insert(
          owned_key,
          Loaded {
            data: data.clone(),
            cached_at: Utc::now(),
          },
        );
      }
    });
    debug!(key, started, "query request");

    let data = future.await.map_err(StoreError::Fetch)?;
    Ok(QueryResult {
      data,
      source: if started {
        CacheSource::Network
      } else {
        CacheSource::InFlight
      },
      cached_at: None,
    })
  }

  /// Drop the result (or pending request) for `key`. The next query issues a
  /// fresh request.
  pub fn unload(&self, key: &str) -> bool {
    let removed = self.loaded().remove(key).is_some();
    let abandoned = self.in_flight.abandon(key);
    debug!(key, removed, abandoned, "query unloaded");
    removed || abandoned
  }

  /// Whether a loaded result is cached under `key`.
  pub fn contains(&self, key: &str) -> bool {
    self.loaded().contains_key(key)
  }

  /// Whether a request for `key` is in flight.
  pub fn is_pending(&self, key: &str) -> bool {
    self.in_flight.contains(key)
  }
}

impl<T: Clone + Send + Sync + 'static> Default for QueryCache<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for QueryCache<T> {
  fn clone(&self) -> Self {
    Self {
      loaded: Arc::clone(&self.loaded),
      in_flight: Arc::clone(&self.in_flight),
      stale_time: self.stale_time,
    }
  }
}
