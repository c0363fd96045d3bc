//! Normalized resource documents and the serializer seam that produces them.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// One resource as pushed into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDocument {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: String,
  #[serde(rename = "type")]
  pub model_name: String,
  #[serde(default)]
  pub attributes: Map<String, Value>,
  /// Projections whose attribute subsets this document loads
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub projection_types: Vec<String>,
  /// Additional model names the record is indexed under
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub sub_types: Vec<String>,
}

impl ResourceDocument {
  pub fn new(model_name: &str, id: &str, attributes: Map<String, Value>) -> Self {
    Self {
      id: id.to_string(),
      model_name: model_name.to_string(),
      attributes,
      projection_types: Vec::new(),
      sub_types: Vec::new(),
    }
  }
}

/// Ids arrive as strings or numbers.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
  One(ResourceDocument),
  Many(Vec<ResourceDocument>),
}

/// A response after normalization: primary data plus side-loaded resources.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NormalizedPayload {
  #[serde(default)]
  pub data: Option<PrimaryData>,
  #[serde(default)]
  pub included: Vec<ResourceDocument>,
}

impl NormalizedPayload {
  pub fn primary(&self) -> Vec<&ResourceDocument> {
    match &self.data {
      Some(PrimaryData::One(doc)) => vec![doc],
      Some(PrimaryData::Many(docs)) => docs.iter().collect(),
      None => Vec::new(),
    }
  }
}

/// Maps raw payloads returned by an [`Adapter`](super::Adapter) to normalized documents.
pub trait Serializer: Send + Sync {
  fn normalize_response(&self, model_name: &str, payload: Value) -> Result<NormalizedPayload>;
}

/// Reads JSON:API-shaped payloads: `{ "data": ..., "included": [...] }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonApiSerializer;

impl Serializer for JsonApiSerializer {
  fn normalize_response(&self, model_name: &str, payload: Value) -> Result<NormalizedPayload> {
    serde_json::from_value(payload)
      .map_err(|e| eyre!("Failed to normalize {} payload: {}", model_name, e))
  }
}
