use std::sync::Arc;

/// Failures callers may want to tell apart.
///
/// These are raised into a `color_eyre::Report`; use
/// `report.downcast_ref::<StoreError>()` to inspect them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
  /// An id is already bound to a different record than the one being built.
  #[error("record {model_name}:{id} is already bound to a different identity")]
  IdentityConflict { model_name: String, id: String },

  /// A deduplicated fetch failed. Every waiter sees the same failure.
  #[error("fetch failed: {0:#}")]
  Fetch(Arc<color_eyre::Report>),

  /// The response did not contain the requested record.
  #[error("no record {model_name}:{id} in response")]
  NotFound { model_name: String, id: String },

  /// The record was unloaded.
  #[error("record {model_name}:{id} has been destroyed")]
  Destroyed { model_name: String, id: String },
}
