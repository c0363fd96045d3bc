use serde_json::Value;

use super::model::Record;
use super::observers::ObserverId;
use crate::projection::Projection;
use crate::schema::Reference;

/// A resolved attribute value.
#[derive(Debug, Clone)]
pub enum Attribute {
  /// Plain data
  Value(Value),
  /// A nested record, or a reference resolved against the cache
  Record(Record),
  /// A nested record or reference seen through a projection
  Projection(Projection),
  /// A reference whose target is not in the cache or whose type is unknown
  Unresolved(Reference),
  /// A list of references or nested records
  List(Vec<Attribute>),
}

impl Attribute {
  pub fn as_value(&self) -> Option<&Value> {
    match self {
      Attribute::Value(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_value().and_then(Value::as_str)
  }

  pub fn as_record(&self) -> Option<&Record> {
    match self {
      Attribute::Record(record) => Some(record),
      _ => None,
    }
  }

  pub fn as_projection(&self) -> Option<&Projection> {
    match self {
      Attribute::Projection(projection) => Some(projection),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Attribute]> {
    match self {
      Attribute::List(items) => Some(items),
      _ => None,
    }
  }

  /// The id of the record this attribute points at, resolved or not.
  pub fn target_id(&self) -> Option<&str> {
    match self {
      Attribute::Record(record) => Some(record.id()),
      Attribute::Projection(projection) => Some(projection.id()),
      Attribute::Unresolved(reference) => Some(&reference.id),
      _ => None,
    }
  }

  /// Step into a nested record or projection.
  pub(crate) fn get(&self, attribute: &str) -> Option<Attribute> {
    match self {
      Attribute::Record(record) => record.get(attribute),
      Attribute::Projection(projection) => projection.get(attribute),
      _ => None,
    }
  }
}

/// What a find or peek resolves to: the canonical record for base model names,
/// a projection for projection names.
#[derive(Debug, Clone)]
pub enum Model {
  Record(Record),
  Projection(Projection),
}

impl Model {
  pub fn id(&self) -> &str {
    match self {
      Model::Record(record) => record.id(),
      Model::Projection(projection) => projection.id(),
    }
  }

  /// The model or projection name the caller asked for.
  pub fn model_name(&self) -> &str {
    match self {
      Model::Record(record) => record.model_name(),
      Model::Projection(projection) => projection.projection_name(),
    }
  }

  pub fn get(&self, attribute: &str) -> Option<Attribute> {
    match self {
      Model::Record(record) => record.get(attribute),
      Model::Projection(projection) => projection.get(attribute),
    }
  }

  pub fn get_value(&self, attribute: &str) -> Option<Value> {
    self.get(attribute).and_then(|a| a.as_value().cloned())
  }

  pub fn get_path(&self, path: &str) -> Option<Attribute> {
    match self {
      Model::Record(record) => record.get_path(path),
      Model::Projection(projection) => projection.get_path(path),
    }
  }

  pub fn set(&self, attribute: &str, value: impl Into<Value>) {
    match self {
      Model::Record(record) => record.set(attribute, value),
      Model::Projection(projection) => projection.set(attribute, value),
    }
  }

  pub fn observe<F>(&self, attribute: &str, callback: F) -> ObserverId
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    match self {
      Model::Record(record) => record.observe(attribute, callback),
      Model::Projection(projection) => projection.observe(attribute, callback),
    }
  }

  pub fn unobserve(&self, id: ObserverId) -> bool {
    match self {
      Model::Record(record) => record.unobserve(id),
      Model::Projection(projection) => projection.unobserve(id),
    }
  }

  /// The canonical record behind this model, if it is still alive.
  pub fn record(&self) -> Option<Record> {
    match self {
      Model::Record(record) => (!record.is_destroyed()).then(|| record.clone()),
      Model::Projection(projection) => projection.parent(),
    }
  }

  pub fn as_projection(&self) -> Option<&Projection> {
    match self {
      Model::Projection(projection) => Some(projection),
      Model::Record(_) => None,
    }
  }

  pub fn as_record(&self) -> Option<&Record> {
    match self {
      Model::Record(record) => Some(record),
      Model::Projection(_) => None,
    }
  }
}

/// Walk a dotted attribute path, stepping through nested records and projections.
pub(crate) fn walk_path(first: Option<Attribute>, rest: std::str::Split<'_, char>) -> Option<Attribute> {
  rest.fold(first, |current, segment| current?.get(segment))
}
