//! Deduplicating cache for URL queries.
//!
//! - At most one request per key is in flight; concurrent callers share it
//! - Loaded results are served from memory until unloaded (or stale, when a
//!   stale time is configured)
//! - Failed requests are never cached, so the next call retries

mod cache;
mod inflight;
mod key;

pub use cache::{CacheSource, QueryCache, QueryResult};
pub use key::{QueryKey, QueryOptions};

pub(crate) use inflight::InFlight;
