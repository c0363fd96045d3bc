//! Panic-isolating front for a registered [`Schema`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{trace, warn};

use super::traits::{NestedModel, Reference, Schema};

/// Which data layer handles a model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dispatch {
  /// Owned by the schema: schema-aware records, this cache's adapter and serializer
  Owned(String),
  /// Handled by the fallback data layer, unchanged
  Fallback(String),
}

impl Dispatch {
  pub fn is_owned(&self) -> bool {
    matches!(self, Dispatch::Owned(_))
  }

  pub fn model_name(&self) -> &str {
    match self {
      Dispatch::Owned(name) | Dispatch::Fallback(name) => name,
    }
  }
}

/// Answers type and attribute policy questions from a registered schema.
///
/// Each call into the schema runs behind `catch_unwind`; a panicking callback
/// is logged and answered with the "no match" value so cache state is never
/// left half-updated. Dispatch decisions are cached per model name.
#[derive(Clone)]
pub struct SchemaResolver {
  schema: Arc<dyn Schema>,
  dispatch_cache: Arc<Mutex<HashMap<String, Dispatch>>>,
}

impl SchemaResolver {
  pub fn new(schema: Arc<dyn Schema>) -> Self {
    Self {
      schema,
      dispatch_cache: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  fn guarded<T>(&self, operation: &str, fallback: T, f: impl FnOnce(&dyn Schema) -> T) -> T {
    match catch_unwind(AssertUnwindSafe(|| f(self.schema.as_ref()))) {
      Ok(value) => value,
      Err(_) => {
        warn!(operation, "schema callback panicked; treating as no match");
        fallback
      }
    }
  }

  pub fn includes_model(&self, model_name: &str) -> bool {
    self.guarded("includes_model", false, |s| s.includes_model(model_name))
  }

  /// Route a model name to this cache or the fallback layer.
  pub fn dispatch(&self, model_name: &str) -> Dispatch {
    let mut cache = self
      .dispatch_cache
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if let Some(dispatch) = cache.get(model_name) {
      return dispatch.clone();
    }
    // Decided on the base name so a projection routes like the model it projects
    let base = self.resolve_model_name(model_name);
    let dispatch = if self.includes_model(model_name) || self.includes_model(&base) {
      Dispatch::Owned(base)
    } else {
      Dispatch::Fallback(base)
    };
    trace!(model_name, ?dispatch, "resolved dispatch");
    cache.insert(model_name.to_string(), dispatch.clone());
    dispatch
  }

  pub fn resolve_model_name(&self, name: &str) -> String {
    self.guarded("resolve_model_name", name.to_string(), |s| {
      s.resolve_model_name(name)
    })
  }

  pub fn resolve_projection_name(&self, name: &str) -> Option<String> {
    self.guarded("resolve_projection_name", None, |s| {
      s.resolve_projection_name(name)
    })
  }

  pub fn is_projection(&self, name: &str) -> bool {
    self.resolve_projection_name(name).is_some()
  }

  pub fn is_attribute_included(&self, projection_name: &str, attribute: &str) -> bool {
    self.guarded("is_attribute_included", false, |s| {
      s.is_attribute_included(projection_name, attribute)
    })
  }

  pub fn compute_projection_type(&self, attribute: &str, projection_name: &str) -> Option<String> {
    self.guarded("compute_projection_type", None, |s| {
      s.compute_projection_type(attribute, projection_name)
    })
  }

  pub fn compute_attribute_reference(&self, attribute: &str, value: &Value) -> Option<Reference> {
    self.guarded("compute_attribute_reference", None, |s| {
      s.compute_attribute_reference(attribute, value)
    })
  }

  pub fn is_attribute_array_reference(&self, attribute: &str) -> bool {
    self.guarded("is_attribute_array_reference", false, |s| {
      s.is_attribute_array_reference(attribute)
    })
  }

  pub fn compute_nested_model(
    &self,
    attribute: &str,
    value: &Value,
    owner_model_name: &str,
  ) -> Option<NestedModel> {
    self.guarded("compute_nested_model", None, |s| {
      s.compute_nested_model(attribute, value, owner_model_name)
    })
  }
}

impl std::fmt::Debug for SchemaResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SchemaResolver").finish_non_exhaustive()
  }
}
