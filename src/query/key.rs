//! Query key normalization.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::network::Method;

/// Options for a URL query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
  pub method: Method,
  pub params: Map<String, Value>,
  /// Explicit cache key; overrides the computed one
  pub cache_key: Option<String>,
  /// Fetch even if a result is cached
  pub reload: bool,
}

impl QueryOptions {
  pub fn with_cache_key(mut self, cache_key: &str) -> Self {
    self.cache_key = Some(cache_key.to_string());
    self
  }

  pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.params.insert(key.to_string(), value.into());
    self
  }

  pub fn reload(mut self) -> Self {
    self.reload = true;
    self
  }
}

/// The request identity of a URL query.
#[derive(Debug, Clone)]
pub struct QueryKey<'a> {
  pub url: &'a str,
  pub options: &'a QueryOptions,
}

impl<'a> QueryKey<'a> {
  pub fn new(url: &'a str, options: &'a QueryOptions) -> Self {
    Self { url, options }
  }

  /// The key results are cached under: the explicit `cache_key` option if
  /// set, otherwise [`cache_hash`](Self::cache_hash).
  pub fn cache_key(&self) -> String {
    self
      .options
      .cache_key
      .clone()
      .unwrap_or_else(|| self.cache_hash())
  }

  /// Stable hash of method, URL and params. Param order does not matter.
  pub fn cache_hash(&self) -> String {
    let mut input = format!("{:?} {}\n", self.options.method, self.url.trim());
    write_canonical(&Value::Object(self.options.params.clone()), &mut input);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    if self.options.params.is_empty() {
      format!("{:?} {}", self.options.method, self.url)
    } else {
      format!(
        "{:?} {} ({} params)",
        self.options.method,
        self.url,
        self.options.params.len()
      )
    }
  }
}

/// Serialize JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::from(key.as_str()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    other => out.push_str(&other.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn options(params: Value) -> QueryOptions {
    QueryOptions {
      params: params.as_object().cloned().unwrap(),
      ..QueryOptions::default()
    }
  }

  #[test]
  fn test_equivalent_queries_share_a_key() {
    let a = options(json!({ "q": "dale", "page": { "size": 10, "number": 1 } }));
    let b = options(json!({ "page": { "number": 1, "size": 10 }, "q": "dale" }));

    assert_eq!(
      QueryKey::new("/search", &a).cache_key(),
      QueryKey::new(" /search ", &b).cache_key()
    );
    assert_eq!(QueryKey::new("/search", &a).cache_key().len(), 64);
  }

  #[test]
  fn test_distinct_queries_differ() {
    let a = options(json!({ "q": "dale" }));
    let b = options(json!({ "q": "katz" }));
    let post = QueryOptions {
      method: Method::Post,
      ..a.clone()
    };

    let key = |o: &QueryOptions| QueryKey::new("/search", o).cache_key();
    assert_ne!(key(&a), key(&b));
    assert_ne!(key(&a), key(&post));
  }

  #[test]
  fn test_explicit_cache_key_wins() {
    let options = QueryOptions::default().with_cache_key("people");
    assert_eq!(QueryKey::new("/people", &options).cache_key(), "people");
  }
}
