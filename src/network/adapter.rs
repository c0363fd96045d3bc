//! Adapter seam and the HTTP implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::config::AdapterConfig;

/// HTTP method for URL queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  #[default]
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Hints handed to the adapter with a find request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterOptions {
  /// Set when the caller asked for a projection, so the adapter can decide
  /// what to request for this id
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub projection_name: Option<String>,
  /// Caller-supplied options, passed through untouched
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
  /// Fetch even if the record (or projection) is already loaded
  pub reload: bool,
  pub adapter_options: AdapterOptions,
}

impl FindOptions {
  pub fn reload() -> Self {
    Self {
      reload: true,
      ..Self::default()
    }
  }
}

/// Performs network requests and returns raw payloads.
#[async_trait]
pub trait Adapter: Send + Sync {
  /// Fetch one record of `model_name`.
  async fn find_record(&self, model_name: &str, id: &str, options: &FindOptions) -> Result<Value>;

  /// Issue a request for an arbitrary URL.
  async fn ajax(&self, url: &str, method: Method, params: &Map<String, Value>) -> Result<Value>;
}

/// [`Adapter`] over HTTP: records live at `{host}/{namespace}/{model}/{id}`,
/// query URLs are resolved against the host.
#[derive(Clone)]
pub struct HttpAdapter {
  client: reqwest::Client,
  host: Url,
  namespace: Option<String>,
}

impl HttpAdapter {
  pub fn new(config: &AdapterConfig) -> Result<Self> {
    let host = Url::parse(&config.host)
      .map_err(|e| eyre!("Invalid adapter host {}: {}", config.host, e))?;
    if host.cannot_be_a_base() {
      return Err(eyre!("Adapter host {} cannot be a base URL", config.host));
    }
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      host,
      namespace: config.namespace.clone(),
    })
  }

  /// URL for a find request. The projection name and any extra adapter
  /// options become query parameters.
  pub fn url_for_find(&self, model_name: &str, id: &str, options: &FindOptions) -> Result<Url> {
    let mut url = self.host.clone();
    {
      let mut segments = url
        .path_segments_mut()
        .map_err(|_| eyre!("Adapter host {} cannot be a base URL", self.host))?;
      segments.pop_if_empty();
      if let Some(namespace) = &self.namespace {
        segments.extend(namespace.split('/').filter(|s| !s.is_empty()));
      }
      segments.push(model_name).push(id);
    }

    let options = &options.adapter_options;
    if options.projection_name.is_some() || !options.extra.is_empty() {
      let mut pairs = url.query_pairs_mut();
      if let Some(projection) = &options.projection_name {
        pairs.append_pair("projection", projection);
      }
      for (key, value) in &options.extra {
        pairs.append_pair(key, &query_value(value));
      }
    }
    Ok(url)
  }

  /// Resolve a query URL against the host. Absolute URLs are kept as is.
  pub fn url_for_query(&self, url: &str) -> Result<Url> {
    self
      .host
      .join(url)
      .map_err(|e| eyre!("Invalid query URL {}: {}", url, e))
  }

  async fn send(&self, method: Method, mut url: Url, params: &Map<String, Value>) -> Result<Value> {
    let request = if method == Method::Get {
      if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
          pairs.append_pair(key, &query_value(value));
        }
      }
      self.client.get(url.clone())
    } else {
      let body = serde_json::to_vec(params).map_err(|e| eyre!("Failed to encode params: {}", e))?;
      self
        .client
        .request(method.into(), url.clone())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
    };

    tracing::debug!(%url, ?method, "sending request");

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

    serde_json::from_slice(&bytes).map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }
}

#[async_trait]
impl Adapter for HttpAdapter {
  async fn find_record(&self, model_name: &str, id: &str, options: &FindOptions) -> Result<Value> {
    let url = self.url_for_find(model_name, id, options)?;
    self.send(Method::Get, url, &Map::new()).await
  }

  async fn ajax(&self, url: &str, method: Method, params: &Map<String, Value>) -> Result<Value> {
    let url = self.url_for_query(url)?;
    self.send(method, url, params).await
  }
}

/// Render a JSON value as a query parameter: strings bare, everything else as JSON.
fn query_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
