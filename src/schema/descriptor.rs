//! Declarative schema descriptor, loadable from YAML.

use std::collections::{BTreeMap, BTreeSet};

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::traits::{NestedModel, Reference, Schema};

/// Serialized form of a schema.
///
/// ```yaml
/// includes:
///   - '^com\.example\.models\.'
/// references:
///   - pattern: '^isbn:'
///     type: com.example.bookstore.Book
///   - pattern: '^urn:(?P<type>[a-zA-Z.]+):(?P<id>.*)'
///   - pattern: '^urn:'
/// array_references: [otherBooksInSeries]
/// models:
///   com.example.projections.CompactPerson:
///     projects: com.example.models.Person
///     attributes: [name, address]
///     attribute_types:
///       address: com.example.projections.CompactAddress
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDescriptor {
  /// Regex patterns matching model names owned by this cache
  #[serde(default)]
  pub includes: Vec<String>,
  /// Reference detection rules, tried in order
  #[serde(default)]
  pub references: Vec<ReferenceRule>,
  /// Attributes holding lists of references
  #[serde(default)]
  pub array_references: BTreeSet<String>,
  /// Treat embedded JSON objects as nested models
  #[serde(default = "default_true")]
  pub nested_objects: bool,
  /// Per-model declarations, keyed by model or projection name
  #[serde(default)]
  pub models: BTreeMap<String, ModelSchema>,
}

fn default_true() -> bool {
  true
}

impl Default for SchemaDescriptor {
  fn default() -> Self {
    Self {
      includes: Vec::new(),
      references: Vec::new(),
      array_references: BTreeSet::new(),
      nested_objects: true,
      models: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceRule {
  /// Regex matched against string values. Named groups `type` and `id`
  /// extract the target; without an `id` group the whole value is the id.
  pub pattern: String,
  /// Fixed target model name for matches
  #[serde(rename = "type", default)]
  pub model_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelSchema {
  /// Base model this projection views. Absent for base models.
  #[serde(default)]
  pub projects: Option<String>,
  /// Whitelisted attributes. Absent means every attribute is visible.
  #[serde(default)]
  pub attributes: Option<BTreeSet<String>>,
  /// Model names for nested attributes: the projection to apply when this is a
  /// projection, and the retype override for nested models owned by this type.
  #[serde(default)]
  pub attribute_types: BTreeMap<String, String>,
}

struct CompiledRule {
  regex: Regex,
  model_name: Option<String>,
}

/// A [`Schema`] compiled from a [`SchemaDescriptor`].
pub struct DescriptorSchema {
  includes: Vec<Regex>,
  references: Vec<CompiledRule>,
  array_references: BTreeSet<String>,
  nested_objects: bool,
  models: BTreeMap<String, ModelSchema>,
}

impl DescriptorSchema {
  pub fn compile(descriptor: SchemaDescriptor) -> Result<Self> {
    let includes = descriptor
      .includes
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid model pattern '{}': {}", p, e)))
      .collect::<Result<Vec<_>>>()?;

    let references = descriptor
      .references
      .into_iter()
      .map(|rule| {
        let regex = Regex::new(&rule.pattern)
          .map_err(|e| eyre!("Invalid reference pattern '{}': {}", rule.pattern, e))?;
        Ok(CompiledRule {
          regex,
          model_name: rule.model_name,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    for (name, model) in &descriptor.models {
      if let Some(base) = &model.projects {
        if descriptor.models.get(base).and_then(|m| m.projects.as_ref()).is_some() {
          return Err(eyre!(
            "Projection {} projects {}, which is itself a projection",
            name,
            base
          ));
        }
      }
    }

    Ok(Self {
      includes,
      references,
      array_references: descriptor.array_references,
      nested_objects: descriptor.nested_objects,
      models: descriptor.models,
    })
  }

  /// Parse and compile a YAML descriptor.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let descriptor: SchemaDescriptor =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse schema: {}", e))?;
    Self::compile(descriptor)
  }
}

impl Schema for DescriptorSchema {
  fn includes_model(&self, model_name: &str) -> bool {
    self.models.contains_key(model_name) || self.includes.iter().any(|r| r.is_match(model_name))
  }

  fn resolve_projection_name(&self, name: &str) -> Option<String> {
    self.models.get(name).and_then(|m| m.projects.clone())
  }

  fn is_attribute_included(&self, projection_name: &str, attribute: &str) -> bool {
    match self.models.get(projection_name) {
      Some(ModelSchema {
        projects: Some(_),
        attributes: Some(attributes),
        ..
      }) => attributes.contains(attribute),
      _ => true,
    }
  }

  fn compute_projection_type(&self, attribute: &str, projection_name: &str) -> Option<String> {
    self
      .models
      .get(projection_name)
      .and_then(|m| m.attribute_types.get(attribute))
      .cloned()
  }

  fn compute_attribute_reference(&self, _attribute: &str, value: &Value) -> Option<Reference> {
    let value = value.as_str()?;
    self.references.iter().find_map(|rule| {
      let captures = rule.regex.captures(value)?;
      let id = captures
        .name("id")
        .map_or(value, |m| m.as_str())
        .to_string();
      let model_name = rule
        .model_name
        .clone()
        .or_else(|| captures.name("type").map(|m| m.as_str().to_string()));
      Some(Reference { model_name, id })
    })
  }

  fn is_attribute_array_reference(&self, attribute: &str) -> bool {
    self.array_references.contains(attribute)
  }

  fn compute_nested_model(
    &self,
    attribute: &str,
    value: &Value,
    owner_model_name: &str,
  ) -> Option<NestedModel> {
    if !self.nested_objects {
      return None;
    }
    let object = value.as_object()?;
    let retyped = self
      .models
      .get(owner_model_name)
      .and_then(|m| m.attribute_types.get(attribute))
      .cloned();
    let model_name = retyped.or_else(|| object.get("type").and_then(Value::as_str).map(String::from));
    let id = object.get("id").and_then(|id| match id {
      Value::String(s) => Some(s.clone()),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    });
    Some(NestedModel {
      model_name,
      id,
      attributes: object.clone(),
    })
  }
}
