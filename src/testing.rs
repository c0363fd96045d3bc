//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use crate::network::{Adapter, FindOptions, Method};
use crate::record::Model;
use crate::schema::DescriptorSchema;
use crate::store::Store;

pub const PERSON: &str = "com.example.models.Person";
pub const COMPACT_PERSON: &str = "com.example.projections.CompactPerson";
pub const ADDRESS_ONLY: &str = "com.example.projections.AddressOnly";
pub const BOOK: &str = "com.example.bookstore.Book";

pub const PERSON_SCHEMA: &str = r#"
includes:
  - '^com\.example\.models\.'
  - '^com\.example\.projections\.'
  - '^com\.example\.bookstore\.'
references:
  - pattern: '^isbn:'
    type: com.example.bookstore.Book
  - pattern: '^urn:(?P<type>[a-zA-Z.]+):(?P<id>.*)'
  - pattern: '^urn:'
array_references: [otherBooksInSeries]
models:
  com.example.projections.CompactPerson:
    projects: com.example.models.Person
    attributes: [name, address]
    attribute_types:
      address: com.example.projections.CompactAddress
  com.example.projections.CompactAddress:
    projects: com.example.models.Address
    attributes: [country]
  com.example.projections.AddressOnly:
    projects: com.example.models.Person
    attributes: [address]
"#;

type Scripted = Mutex<VecDeque<Result<Value, String>>>;

/// Adapter answering from scripted responses. Each call takes the next
/// response; the last one keeps answering once the script runs out.
#[derive(Default)]
pub struct MockAdapter {
  finds: Scripted,
  queries: Scripted,
  find_calls: Mutex<Vec<(String, String, FindOptions)>>,
  ajax_calls: AtomicUsize,
}

fn next(script: &Scripted) -> Result<Value> {
  let mut script = script.lock().unwrap();
  let response = if script.len() > 1 {
    script.pop_front()
  } else {
    script.front().cloned()
  };
  match response {
    Some(Ok(value)) => Ok(value),
    Some(Err(message)) => Err(eyre!(message)),
    None => Err(eyre!("no scripted response")),
  }
}

impl MockAdapter {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond_find(&self, payload: Value) {
    self.finds.lock().unwrap().push_back(Ok(payload));
  }

  pub fn fail_find(&self, message: &str) {
    self.finds.lock().unwrap().push_back(Err(message.to_string()));
  }

  pub fn respond_query(&self, payload: Value) {
    self.queries.lock().unwrap().push_back(Ok(payload));
  }

  pub fn find_count(&self) -> usize {
    self.find_calls.lock().unwrap().len()
  }

  pub fn find_calls(&self) -> Vec<(String, String, FindOptions)> {
    self.find_calls.lock().unwrap().clone()
  }

  pub fn ajax_count(&self) -> usize {
    self.ajax_calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Adapter for MockAdapter {
  async fn find_record(&self, model_name: &str, id: &str, options: &FindOptions) -> Result<Value> {
    self
      .find_calls
      .lock()
      .unwrap()
      .push((model_name.to_string(), id.to_string(), options.clone()));
    // Suspend once so overlapping callers can join the pending request
    tokio::task::yield_now().await;
    next(&self.finds)
  }

  async fn ajax(&self, _url: &str, _method: Method, _params: &Map<String, Value>) -> Result<Value> {
    self.ajax_calls.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;
    next(&self.queries)
  }
}

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn person_store(adapter: &Arc<MockAdapter>) -> Store {
  init_tracing();
  let schema = DescriptorSchema::from_yaml(PERSON_SCHEMA).unwrap();
  Store::new(Arc::new(schema), adapter.clone())
}

/// Person 1 as the full base model.
pub fn initial_payload() -> Value {
  json!({
    "data": {
      "id": "1",
      "type": PERSON,
      "attributes": {
        "name": "Tom Dale",
        "description": "JavaScript thinkfluencer",
        "address": { "street": "Main St", "country": "US" }
      }
    }
  })
}

/// Person `id` loaded with the given projections only.
pub fn with_projection_types(id: &str, attributes: Value, projections: &[&str]) -> Value {
  json!({
    "data": {
      "id": id,
      "type": PERSON,
      "attributes": attributes,
      "projectionTypes": projections
    }
  })
}

/// Count change notifications for `attribute` on `model`.
pub fn watch_property(model: &Model, attribute: &str) -> Arc<AtomicUsize> {
  let count = Arc::new(AtomicUsize::new(0));
  let c = count.clone();
  model.observe(attribute, move |_| {
    c.fetch_add(1, Ordering::SeqCst);
  });
  count
}
