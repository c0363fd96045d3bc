//! Restricted views over a canonical record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::trace;

use crate::record::{Attribute, ObserverId, Observers, Record, RecordInner};
use crate::schema::SchemaResolver;

/// A view of one record under a projection name.
///
/// Projections hold no attribute state of their own: reads and writes go
/// straight to the parent record, filtered by the schema's inclusion rules.
/// Excluded attributes read as absent and ignore writes. The parent is held
/// weakly; once it is destroyed the projection reads absent everywhere.
#[derive(Clone)]
pub struct Projection {
  inner: Arc<ProjectionInner>,
}

struct ProjectionInner {
  id: String,
  projection_name: String,
  parent: Weak<RecordInner>,
  resolver: Option<SchemaResolver>,
  observers: Observers,
  invalidated: AtomicBool,
}

impl Projection {
  pub(crate) fn new(parent: &Record, projection_name: &str, resolver: Option<SchemaResolver>) -> Self {
    Self {
      inner: Arc::new(ProjectionInner {
        id: parent.id().to_string(),
        projection_name: projection_name.to_string(),
        parent: parent.downgrade(),
        resolver,
        observers: Observers::default(),
        invalidated: AtomicBool::new(false),
      }),
    }
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  pub fn projection_name(&self) -> &str {
    &self.inner.projection_name
  }

  /// The record this projection views, unless it has been destroyed.
  pub fn parent(&self) -> Option<Record> {
    if self.inner.invalidated.load(Ordering::Acquire) {
      return None;
    }
    let parent = Record::from_inner(self.inner.parent.upgrade()?);
    (!parent.is_destroyed()).then_some(parent)
  }

  pub fn is_valid(&self) -> bool {
    self.parent().is_some()
  }

  pub fn ptr_eq(&self, other: &Projection) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  pub fn is_attribute_included(&self, attribute: &str) -> bool {
    match &self.inner.resolver {
      Some(resolver) => resolver.is_attribute_included(&self.inner.projection_name, attribute),
      None => true,
    }
  }

  /// Read an included attribute. Nested records come back as projections
  /// under the type the schema assigns to `attribute`.
  pub fn get(&self, attribute: &str) -> Option<Attribute> {
    if !self.is_attribute_included(attribute) {
      return None;
    }
    let value = self.parent()?.get(attribute)?;
    Some(self.project(attribute, value))
  }

  pub fn get_value(&self, attribute: &str) -> Option<Value> {
    self.get(attribute).and_then(|a| a.as_value().cloned())
  }

  /// Read a dotted path; every segment must be included by the projection
  /// in effect at that depth.
  pub fn get_path(&self, path: &str) -> Option<Attribute> {
    let mut segments = path.split('.');
    let first = self.get(segments.next()?);
    crate::record::walk_path(first, segments)
  }

  fn project(&self, attribute: &str, value: Attribute) -> Attribute {
    match value {
      Attribute::Record(record) => {
        let projection_name = self
          .inner
          .resolver
          .as_ref()
          .and_then(|r| r.compute_projection_type(attribute, &self.inner.projection_name))
          .unwrap_or_else(|| record.model_name().to_string());
        Attribute::Projection(record.projection(&projection_name))
      }
      Attribute::List(items) => Attribute::List(
        items
          .into_iter()
          .map(|item| self.project(attribute, item))
          .collect(),
      ),
      other => other,
    }
  }

  /// Write an included attribute through to the parent record.
  pub fn set(&self, attribute: &str, value: impl Into<Value>) {
    if !self.is_attribute_included(attribute) {
      trace!(projection = %self.inner.projection_name, attribute, "ignored write to excluded attribute");
      return;
    }
    if let Some(parent) = self.parent() {
      parent.set(attribute, value);
    }
  }

  pub fn observe<F>(&self, attribute: &str, callback: F) -> ObserverId
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    self.inner.observers.add(attribute, callback)
  }

  pub fn unobserve(&self, id: ObserverId) -> bool {
    self.inner.observers.remove(id)
  }

  /// Re-raise parent changes, silently dropping excluded attributes.
  pub fn notify_changed_attributes(&self, attributes: &[String]) {
    if self.inner.invalidated.load(Ordering::Acquire) {
      return;
    }
    let included: Vec<String> = attributes
      .iter()
      .filter(|a| self.is_attribute_included(a))
      .cloned()
      .collect();
    if !included.is_empty() {
      self.inner.observers.notify(&included);
    }
  }

  pub(crate) fn invalidate(&self) {
    self.inner.invalidated.store(true, Ordering::Release);
    self.inner.observers.clear();
  }
}

impl std::fmt::Debug for Projection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Projection")
      .field("projection_name", &self.inner.projection_name)
      .field("id", &self.inner.id)
      .finish_non_exhaustive()
  }
}
