//! Core traits and types for schema descriptors.

use serde_json::{Map, Value};

/// A reference from an attribute value to another record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
  /// Target model name. `None` when the reference format does not encode it.
  pub model_name: Option<String>,
  /// Target record id
  pub id: String,
}

/// An embedded object that should itself be treated as a record.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedModel {
  /// Effective model name, after any retype override of the owning type
  pub model_name: Option<String>,
  /// Id, if the embedded object carries one
  pub id: Option<String>,
  pub attributes: Map<String, Value>,
}

impl NestedModel {
  /// Whether `other` describes the same nested identity as `self`.
  ///
  /// Both sides must agree on id and model name; two anonymous nested
  /// objects in the same slot are considered the same.
  pub fn same_identity(&self, other: &NestedModel) -> bool {
    self.id == other.id && self.model_name == other.model_name
  }
}

/// Schema descriptor registered with a store.
///
/// Implementations must be total and free of side effects. A panicking
/// callback is caught by [`SchemaResolver`](super::SchemaResolver) and
/// treated as "no match".
pub trait Schema: Send + Sync {
  /// True if this cache, not the fallback data layer, owns the model name.
  fn includes_model(&self, model_name: &str) -> bool;

  /// The base model name projected by `name`, or `None` if `name` is not a
  /// registered projection.
  fn resolve_projection_name(&self, name: &str) -> Option<String>;

  /// The model name under which records for `name` are allocated.
  fn resolve_model_name(&self, name: &str) -> String {
    self
      .resolve_projection_name(name)
      .unwrap_or_else(|| name.to_string())
  }

  /// Whether `attribute` is visible through `projection_name`.
  fn is_attribute_included(&self, projection_name: &str, attribute: &str) -> bool;

  /// The projection applied to the nested record held in `attribute` when it
  /// is viewed through `projection_name`.
  fn compute_projection_type(&self, attribute: &str, projection_name: &str) -> Option<String>;

  /// Detect whether a value encodes a reference to another record.
  fn compute_attribute_reference(&self, attribute: &str, value: &Value) -> Option<Reference>;

  /// Whether `attribute` holds a list of references rather than one.
  fn is_attribute_array_reference(&self, attribute: &str) -> bool;

  /// Detect an embedded object that should become a record of its own.
  fn compute_nested_model(
    &self,
    attribute: &str,
    value: &Value,
    owner_model_name: &str,
  ) -> Option<NestedModel>;
}
