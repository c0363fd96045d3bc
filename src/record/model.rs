//! The canonical in-memory record.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use serde_json::{Map, Value};
use tracing::{trace, warn};

use super::attribute::{walk_path, Attribute};
use super::observers::{ObserverId, Observers};
use crate::projection::Projection;
use crate::schema::{NestedModel, SchemaResolver};
use crate::store::StoreShared;

/// One resource's full attribute set.
///
/// Cloning a `Record` clones a handle; every clone and every projection
/// observes the same attributes.
#[derive(Clone)]
pub struct Record {
  inner: Arc<RecordInner>,
}

pub(crate) struct RecordInner {
  id: String,
  model_name: String,
  /// Lives only inside a parent attribute slot, never in the identity index
  embedded: bool,
  /// `None` for records of the fallback layer, which hold plain data only
  resolver: Option<SchemaResolver>,
  store: Weak<StoreShared>,
  state: RwLock<RecordState>,
  observers: Observers,
  destroyed: AtomicBool,
}

#[derive(Default)]
struct RecordState {
  attributes: Map<String, Value>,
  /// Materialized nested records, keyed by attribute
  nested: HashMap<String, NestedSlot>,
  projections: HashMap<String, Projection>,
  base_loaded: bool,
  loaded_projections: HashSet<String>,
}

enum NestedSlot {
  One(Record),
  Many(Vec<Attribute>),
}

impl NestedSlot {
  fn to_attribute(&self) -> Attribute {
    match self {
      NestedSlot::One(record) => Attribute::Record(record.clone()),
      NestedSlot::Many(items) => Attribute::List(items.clone()),
    }
  }

  /// Holds a record that was destroyed since the slot was filled.
  fn is_stale(&self) -> bool {
    match self {
      NestedSlot::One(record) => record.is_destroyed(),
      NestedSlot::Many(items) => items
        .iter()
        .filter_map(Attribute::as_record)
        .any(Record::is_destroyed),
    }
  }

  fn destroy_embedded(&self) {
    let records: Vec<&Record> = match self {
      NestedSlot::One(record) => vec![record],
      NestedSlot::Many(items) => items.iter().filter_map(Attribute::as_record).collect(),
    };
    for record in records.into_iter().filter(|r| r.is_embedded()) {
      record.destroy();
    }
  }
}

impl Record {
  pub(crate) fn new(
    store: Weak<StoreShared>,
    resolver: Option<SchemaResolver>,
    model_name: &str,
    id: &str,
    embedded: bool,
  ) -> Self {
    Self {
      inner: Arc::new(RecordInner {
        id: id.to_string(),
        model_name: model_name.to_string(),
        embedded,
        resolver,
        store,
        state: RwLock::new(RecordState::default()),
        observers: Observers::default(),
        destroyed: AtomicBool::new(false),
      }),
    }
  }

  pub(crate) fn from_inner(inner: Arc<RecordInner>) -> Self {
    Self { inner }
  }

  pub(crate) fn downgrade(&self) -> Weak<RecordInner> {
    Arc::downgrade(&self.inner)
  }

  fn read(&self) -> RwLockReadGuard<'_, RecordState> {
    self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(&self) -> RwLockWriteGuard<'_, RecordState> {
    self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn id(&self) -> &str {
    &self.inner.id
  }

  /// The base model name the record was allocated under.
  pub fn model_name(&self) -> &str {
    &self.inner.model_name
  }

  /// True for nested records owned by a parent attribute.
  pub fn is_embedded(&self) -> bool {
    self.inner.embedded
  }

  pub fn is_destroyed(&self) -> bool {
    self.inner.destroyed.load(Ordering::Acquire)
  }

  pub fn ptr_eq(&self, other: &Record) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }

  /// Whether the full base model has been loaded for this id.
  pub fn is_loaded(&self) -> bool {
    self.read().base_loaded
  }

  /// Whether the attribute subset of `projection_name` has been loaded.
  pub fn is_projection_loaded(&self, projection_name: &str) -> bool {
    self.read().loaded_projections.contains(projection_name)
  }

  pub(crate) fn mark_loaded(&self) {
    self.write().base_loaded = true;
  }

  pub(crate) fn mark_projection_loaded(&self, projection_name: &str) {
    self
      .write()
      .loaded_projections
      .insert(projection_name.to_string());
  }

  /// Snapshot of the raw attribute data.
  pub fn attributes(&self) -> Map<String, Value> {
    self.read().attributes.clone()
  }

  /// Read an attribute, resolving references and nested objects.
  pub fn get(&self, attribute: &str) -> Option<Attribute> {
    if self.is_destroyed() {
      return None;
    }
    let raw = {
      let state = self.read();
      match state.nested.get(attribute) {
        Some(slot) if !slot.is_stale() => return Some(slot.to_attribute()),
        _ => {}
      }
      state.attributes.get(attribute)?.clone()
    };
    match &self.inner.resolver {
      Some(resolver) => Some(self.resolve(resolver, attribute, raw)),
      None => Some(Attribute::Value(raw)),
    }
  }

  /// Read a plain value; `None` for absent, nested or reference attributes.
  pub fn get_value(&self, attribute: &str) -> Option<Value> {
    self.get(attribute).and_then(|a| a.as_value().cloned())
  }

  /// Read a dotted path such as `address.country`.
  pub fn get_path(&self, path: &str) -> Option<Attribute> {
    let mut segments = path.split('.');
    let first = self.get(segments.next()?);
    walk_path(first, segments)
  }

  /// Write an attribute and notify every view that includes it.
  ///
  /// Writing an object over a nested record with the same identity merges
  /// into that record instead of replacing it.
  pub fn set(&self, attribute: &str, value: impl Into<Value>) {
    let mut attributes = Map::new();
    attributes.insert(attribute.to_string(), value.into());
    self.merge_attributes(attributes);
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

  /// The projection of this record named `projection_name`.
  ///
  /// A record keeps one projection per name, so repeated calls return views
  /// sharing the same observers.
  pub fn projection(&self, projection_name: &str) -> Projection {
    let mut state = self.write();
    state
      .projections
      .entry(projection_name.to_string())
      .or_insert_with(|| Projection::new(self, projection_name, self.inner.resolver.clone()))
      .clone()
  }

  /// Merge attributes in place and fire change notifications once per
  /// changed attribute. Nested objects naming an owned model and an id are
  /// pushed into the store before observers run. Returns the changed
  /// attribute names.
  pub(crate) fn merge_attributes(&self, attributes: Map<String, Value>) -> Vec<String> {
    if self.is_destroyed() {
      return Vec::new();
    }
    let mut changed = Vec::new();
    let mut nested_merges = Vec::new();
    let mut dropped = Vec::new();
    let mut incoming = Vec::new();
    {
      let mut state = self.write();
      for (key, value) in attributes {
        let current = state.attributes.get(&key);
        if current == Some(&value) {
          continue;
        }
        let merge_in_place = current.is_some_and(|old| self.same_nested(&key, old, &value));
        incoming.push((key.clone(), value.clone()));

        if merge_in_place {
          let Some(current) = state.attributes.get_mut(&key) else {
            continue;
          };
          let mut merged = current.clone();
          merge_json(&mut merged, value.clone());
          if merged == *current {
            continue;
          }
          *current = merged;
          let nested_record = match state.nested.get(&key) {
            Some(NestedSlot::One(record)) => Some(record.clone()),
            _ => None,
          };
          // Shared nested records take the patch through `push_nested` below
          match (nested_record, value) {
            (Some(record), Value::Object(patch)) if record.is_embedded() => {
              nested_merges.push((record, patch))
            }
            _ => dropped.extend(state.nested.remove(&key)),
          }
        } else {
          dropped.extend(state.nested.remove(&key));
          state.attributes.insert(key.clone(), value);
        }
        changed.push(key);
      }
    }

    for slot in dropped {
      slot.destroy_embedded();
    }
    for (record, patch) in nested_merges {
      record.merge_attributes(patch);
    }
    self.push_nested_identities(incoming);
    if !changed.is_empty() {
      trace!(id = %self.inner.id, model = %self.inner.model_name, ?changed, "attributes changed");
      self.notify_changed(&changed);
    }
    changed
  }

  fn notify_changed(&self, attributes: &[String]) {
    self.inner.observers.notify(attributes);
    let projections: Vec<Projection> = self.read().projections.values().cloned().collect();
    for projection in projections {
      projection.notify_changed_attributes(attributes);
    }
  }

  /// Both values describe the same nested record.
  fn same_nested(&self, attribute: &str, old: &Value, new: &Value) -> bool {
    let Some(resolver) = &self.inner.resolver else {
      return false;
    };
    if !(old.is_object() && new.is_object()) {
      return false;
    }
    let model_name = &self.inner.model_name;
    match (
      resolver.compute_nested_model(attribute, old, model_name),
      resolver.compute_nested_model(attribute, new, model_name),
    ) {
      (Some(a), Some(b)) => a.same_identity(&b),
      _ => false,
    }
  }

  /// Push every nested object in `values` that names an owned model and an
  /// id, so the shared record is indexed and current without a read.
  fn push_nested_identities(&self, values: Vec<(String, Value)>) {
    let (Some(resolver), Some(store)) = (&self.inner.resolver, self.inner.store.upgrade()) else {
      return;
    };
    for (attribute, value) in values {
      let items = match value {
        Value::Array(items) => items,
        other => vec![other],
      };
      for item in items.iter().filter(|item| item.is_object()) {
        if resolver.compute_attribute_reference(&attribute, item).is_some() {
          continue;
        }
        let Some(NestedModel {
          model_name: Some(model_name),
          id: Some(id),
          attributes,
        }) = resolver.compute_nested_model(&attribute, item, &self.inner.model_name)
        else {
          continue;
        };
        if !resolver.includes_model(&model_name) {
          continue;
        }
        if let Err(e) = store.push_nested(&model_name, &id, attributes) {
          warn!(%model_name, %id, error = %e, "nested record not indexed");
        }
      }
    }
  }

  fn resolve(&self, resolver: &SchemaResolver, attribute: &str, raw: Value) -> Attribute {
    if raw.is_null() {
      return Attribute::Value(raw);
    }

    if let Value::Array(items) = &raw {
      if resolver.is_attribute_array_reference(attribute) {
        return Attribute::List(
          items
            .iter()
            .map(|item| {
              self
                .resolve_reference(resolver, attribute, item)
                .unwrap_or_else(|| Attribute::Value(item.clone()))
            })
            .collect(),
        );
      }
    }

    if let Some(reference) = self.resolve_reference(resolver, attribute, &raw) {
      return reference;
    }

    if let Value::Array(items) = &raw {
      let items: Vec<Attribute> = items
        .iter()
        .map(
          |item| match resolver.compute_nested_model(attribute, item, &self.inner.model_name) {
            Some(nested) => Attribute::Record(self.materialize(nested)),
            None => Attribute::Value(item.clone()),
          },
        )
        .collect();
      if items.iter().any(|item| item.as_record().is_some()) {
        return self.cache_slot(attribute, &raw, NestedSlot::Many(items));
      }
      return Attribute::Value(raw.clone());
    }

    if let Some(nested) = resolver.compute_nested_model(attribute, &raw, &self.inner.model_name) {
      let record = self.materialize(nested);
      return self.cache_slot(attribute, &raw, NestedSlot::One(record));
    }

    Attribute::Value(raw)
  }

  fn resolve_reference(
    &self,
    resolver: &SchemaResolver,
    attribute: &str,
    value: &Value,
  ) -> Option<Attribute> {
    let reference = resolver.compute_attribute_reference(attribute, value)?;
    let target = self
      .inner
      .store
      .upgrade()
      .and_then(|store| store.peek_reference(&reference));
    Some(match target {
      Some(record) => Attribute::Record(record),
      None => Attribute::Unresolved(reference),
    })
  }

  /// Turn a nested model into a record: the shared record from the identity
  /// index when it names an owned model and an id, an embedded one otherwise.
  /// Reading never writes to the shared record.
  fn materialize(&self, nested: NestedModel) -> Record {
    if let (Some(model_name), Some(id), Some(store)) =
      (&nested.model_name, &nested.id, self.inner.store.upgrade())
    {
      if store.resolver().includes_model(model_name) {
        if let Some(record) = store.peek_nested(model_name, id) {
          return record;
        }
      }
    }

    let record = Record::new(
      self.inner.store.clone(),
      self.inner.resolver.clone(),
      nested.model_name.as_deref().unwrap_or_default(),
      nested.id.as_deref().unwrap_or_default(),
      true,
    );
    record.write().attributes = nested.attributes;
    record
  }

  fn cache_slot(&self, attribute: &str, raw: &Value, slot: NestedSlot) -> Attribute {
    let mut state = self.write();
    if state.attributes.get(attribute) != Some(raw) {
      // Attribute was rewritten while the slot was being built
      return slot.to_attribute();
    }
    match state.nested.get(attribute) {
      Some(existing) if !existing.is_stale() => existing.to_attribute(),
      _ => {
        let value = slot.to_attribute();
        state.nested.insert(attribute.to_string(), slot);
        value
      }
    }
  }

  /// Mark destroyed and invalidate every view. Embedded nested records go with it.
  pub(crate) fn destroy(&self) {
    if self.inner.destroyed.swap(true, Ordering::AcqRel) {
      return;
    }
    let (projections, nested) = {
      let mut state = self.write();
      (
        std::mem::take(&mut state.projections),
        std::mem::take(&mut state.nested),
      )
    };
    self.inner.observers.clear();
    for projection in projections.values() {
      projection.invalidate();
    }
    for slot in nested.values() {
      slot.destroy_embedded();
    }
  }
}

impl std::fmt::Debug for Record {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Record")
      .field("model_name", &self.inner.model_name)
      .field("id", &self.inner.id)
      .field("destroyed", &self.is_destroyed())
      .finish_non_exhaustive()
  }
}

/// Deep-merge `patch` into `target`: objects merge key by key, anything else replaces.
pub(crate) fn merge_json(target: &mut Value, patch: Value) {
  match (target, patch) {
    (Value::Object(target), Value::Object(patch)) => {
      for (key, value) in patch {
        match target.get_mut(&key) {
          Some(existing) => merge_json(existing, value),
          None => {
            target.insert(key, value);
          }
        }
      }
    }
    (target, patch) => *target = patch,
  }
}
