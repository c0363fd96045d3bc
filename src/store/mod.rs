//! The record cache: identity-keyed storage, type dispatch between this cache
//! and the fallback data layer, and the find/push/destroy lifecycle.

mod index;
#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Duration;
use color_eyre::{Report, Result};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use self::index::{Index, RecordKey};
use crate::config::Config;
use crate::error::StoreError;
use crate::network::{
  Adapter, FindOptions, HttpAdapter, JsonApiSerializer, NormalizedPayload, PrimaryData,
  ResourceDocument, Serializer,
};
use crate::query::{InFlight, QueryCache, QueryOptions, QueryResult};
use crate::record::{Model, Record};
use crate::schema::{DescriptorSchema, Dispatch, Reference, Schema, SchemaResolver};

/// How records of a model name are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFactory {
  /// Schema-aware records: references and nested objects resolve, projections apply
  Schema,
  /// Plain records of the fallback layer
  Plain,
}

/// The data layer that handles model names the schema does not own.
#[derive(Clone)]
pub struct DataLayer {
  adapter: Arc<dyn Adapter>,
  serializer: Arc<dyn Serializer>,
  models: HashSet<String>,
}

impl DataLayer {
  pub fn new(adapter: Arc<dyn Adapter>, serializer: Arc<dyn Serializer>) -> Self {
    Self {
      adapter,
      serializer,
      models: HashSet::new(),
    }
  }

  /// Register the model names this layer knows about.
  pub fn with_models<I, S>(mut self, models: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.models.extend(models.into_iter().map(Into::into));
    self
  }

  pub fn has_model(&self, model_name: &str) -> bool {
    self.models.contains(model_name)
  }
}

/// Records produced by a push or a URL query.
#[derive(Debug, Clone)]
pub enum QueryData {
  One(Record),
  Many(Vec<Record>),
  Empty,
}

impl QueryData {
  pub fn records(&self) -> Vec<Record> {
    match self {
      QueryData::One(record) => vec![record.clone()],
      QueryData::Many(records) => records.clone(),
      QueryData::Empty => Vec::new(),
    }
  }
}

struct Allocation {
  dispatch: Dispatch,
  existing: Option<Record>,
  primary: RecordKey,
  aliases: Vec<RecordKey>,
}

pub(crate) struct StoreShared {
  resolver: SchemaResolver,
  index: Mutex<Index>,
  adapter: Arc<dyn Adapter>,
  serializer: Arc<dyn Serializer>,
  fallback: DataLayer,
  finds: InFlight<Record>,
  queries: QueryCache<QueryData>,
}

/// Client-side cache of canonical records and their projections.
///
/// Cloning a `Store` clones a handle to the same cache.
#[derive(Clone)]
pub struct Store {
  shared: Arc<StoreShared>,
}

pub struct StoreBuilder {
  schema: Arc<dyn Schema>,
  adapter: Arc<dyn Adapter>,
  serializer: Arc<dyn Serializer>,
  fallback: Option<DataLayer>,
  query_stale_time: Option<Duration>,
}

impl StoreBuilder {
  pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
    self.serializer = serializer;
    self
  }

  pub fn fallback(mut self, fallback: DataLayer) -> Self {
    self.fallback = Some(fallback);
    self
  }

  pub fn query_stale_time(mut self, stale_time: Duration) -> Self {
    self.query_stale_time = Some(stale_time);
    self
  }

  pub fn build(self) -> Store {
    let fallback = self
      .fallback
      .unwrap_or_else(|| DataLayer::new(Arc::clone(&self.adapter), Arc::clone(&self.serializer)));
    let queries = match self.query_stale_time {
      Some(stale_time) => QueryCache::new().with_stale_time(stale_time),
      None => QueryCache::new(),
    };

    Store {
      shared: Arc::new(StoreShared {
        resolver: SchemaResolver::new(self.schema),
        index: Mutex::new(Index::default()),
        adapter: self.adapter,
        serializer: self.serializer,
        fallback,
        finds: InFlight::new(),
        queries,
      }),
    }
  }
}

/// Key for a pending find. `\u{1f}` cannot appear in model names or ids
/// coming from JSON:API documents in practice.
fn fetch_key(model_name: &str, id: &str, projection: Option<&str>) -> String {
  format!(
    "{}\u{1f}{}\u{1f}{}",
    model_name,
    id,
    projection.unwrap_or_default()
  )
}

impl StoreShared {
  pub(crate) fn resolver(&self) -> &SchemaResolver {
    &self.resolver
  }

  fn index(&self) -> MutexGuard<'_, Index> {
    self.index.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn adapter_for(&self, model_name: &str) -> Arc<dyn Adapter> {
    match self.resolver.dispatch(model_name) {
      Dispatch::Owned(_) => Arc::clone(&self.adapter),
      Dispatch::Fallback(_) => Arc::clone(&self.fallback.adapter),
    }
  }

  fn serializer_for(&self, model_name: &str) -> Arc<dyn Serializer> {
    match self.resolver.dispatch(model_name) {
      Dispatch::Owned(_) => Arc::clone(&self.serializer),
      Dispatch::Fallback(_) => Arc::clone(&self.fallback.serializer),
    }
  }

  /// Look up by model, projection or sub-type name.
  fn lookup(&self, model_name: &str, id: &str) -> Result<Option<Record>> {
    let base = self.resolver.resolve_model_name(model_name);
    self
      .index()
      .lookup(&RecordKey::new(model_name, id), &RecordKey::new(&base, id))
  }

  pub(crate) fn peek_reference(&self, reference: &Reference) -> Option<Record> {
    match &reference.model_name {
      Some(model_name) => self.lookup(model_name, &reference.id).ok().flatten(),
      None => self.index().by_id(&reference.id),
    }
  }

  /// The shared record a nested object names, if it has been pushed.
  pub(crate) fn peek_nested(&self, model_name: &str, id: &str) -> Option<Record> {
    self.lookup(model_name, id).ok().flatten()
  }

  /// Resolve where `(model_name, id)` lives and check that `sub_types` can be
  /// bound to it, without touching the index.
  fn plan(&self, index: &Index, model_name: &str, id: &str, sub_types: &[String]) -> Result<Allocation> {
    let dispatch = self.resolver.dispatch(model_name);
    let requested = RecordKey::new(model_name, id);
    let key = RecordKey::new(dispatch.model_name(), id);

    let existing = index.lookup(&requested, &key)?;
    let primary = existing
      .as_ref()
      .map_or(key, |r| RecordKey::new(r.model_name(), r.id()));
    let aliases: Vec<RecordKey> = sub_types.iter().map(|s| RecordKey::new(s, id)).collect();
    index.check_aliases(&aliases, &primary)?;

    Ok(Allocation {
      dispatch,
      existing,
      primary,
      aliases,
    })
  }

  /// Find or allocate the record for `(model_name, id)` and bind `sub_types`
  /// to it. Nothing is modified if any binding would conflict.
  fn allocate(
    self: &Arc<Self>,
    index: &mut Index,
    model_name: &str,
    id: &str,
    sub_types: &[String],
  ) -> Result<Record> {
    let Allocation {
      dispatch,
      existing,
      primary,
      aliases,
    } = self.plan(index, model_name, id, sub_types)?;

    let record = match existing {
      Some(record) => record,
      None => {
        let resolver = dispatch.is_owned().then(|| self.resolver.clone());
        let record = Record::new(Arc::downgrade(self), resolver, &primary.model_name, id, false);
        index.insert(primary.clone(), record.clone(), dispatch.is_owned());
        trace!(model = %primary.model_name, id, owned = dispatch.is_owned(), "allocated record");
        record
      }
    };
    index.bind_aliases(aliases, &primary);
    Ok(record)
  }

  fn build_record(self: &Arc<Self>, model_name: &str, id: &str, data: Map<String, Value>) -> Result<Record> {
    let record = {
      let mut index = self.index();
      self.allocate(&mut index, model_name, id, &[])?
    };
    record.merge_attributes(data);
    Ok(record)
  }

  pub(crate) fn push_nested(
    self: &Arc<Self>,
    model_name: &str,
    id: &str,
    attributes: Map<String, Value>,
  ) -> Result<Record> {
    self.build_record(model_name, id, attributes)
  }

  fn push_document(self: &Arc<Self>, document: ResourceDocument) -> Result<Record> {
    let record = {
      let mut index = self.index();
      self.allocate(&mut index, &document.model_name, &document.id, &document.sub_types)?
    };

    if self.resolver.is_projection(&document.model_name) {
      record.mark_projection_loaded(&document.model_name);
    } else if document.projection_types.is_empty() {
      record.mark_loaded();
    }
    // Loaded with projections: only those attribute subsets are known to be present
    for projection in &document.projection_types {
      record.mark_projection_loaded(projection);
    }

    debug!(
      model = %document.model_name,
      id = %document.id,
      projections = ?document.projection_types,
      sub_types = ?document.sub_types,
      "pushed document"
    );
    record.merge_attributes(document.attributes);
    Ok(record)
  }

  /// Push every document of a payload. Identity conflicts against the cache
  /// are checked for all documents first, so a conflicting payload changes
  /// nothing.
  fn push_normalized(self: &Arc<Self>, payload: NormalizedPayload) -> Result<QueryData> {
    {
      let index = self.index();
      let primary = payload.primary();
      for document in payload.included.iter().chain(primary) {
        self.plan(&index, &document.model_name, &document.id, &document.sub_types)?;
      }
    }

    for document in payload.included {
      self.push_document(document)?;
    }
    Ok(match payload.data {
      Some(PrimaryData::One(document)) => QueryData::One(self.push_document(document)?),
      Some(PrimaryData::Many(documents)) => QueryData::Many(
        documents
          .into_iter()
          .map(|document| self.push_document(document))
          .collect::<Result<Vec<_>>>()?,
      ),
      None => QueryData::Empty,
    })
  }

  /// Fetch `(model_name, id)` through the dispatched adapter, sharing the
  /// request with any caller already waiting on the same key.
  async fn fetch(
    self: &Arc<Self>,
    model_name: &str,
    id: &str,
    projection: Option<&str>,
    options: FindOptions,
  ) -> Result<Record> {
    let key = fetch_key(model_name, id, projection);
    let shared = Arc::clone(self);
    let model_name = model_name.to_string();
    let id = id.to_string();
    let projection = projection.map(String::from);

    let (future, started) = self.finds.join_or_start(
      &key,
      move || async move {
        let adapter = shared.adapter_for(&model_name);
        let serializer = shared.serializer_for(&model_name);
        let payload = adapter.find_record(&model_name, &id, &options).await?;
        let normalized = serializer.normalize_response(&model_name, payload)?;
        let records = shared.push_normalized(normalized)?.records();

        let record = records
          .into_iter()
          .find(|r| r.id() == id)
          .ok_or_else(|| StoreError::NotFound {
            model_name: model_name.clone(),
            id: id.clone(),
          })?;
        match &projection {
          Some(projection) => record.mark_projection_loaded(projection),
          None => record.mark_loaded(),
        }
        Ok::<_, Report>(record)
      },
      |_| {},
    );
    debug!(key = %key.replace('\u{1f}', ":"), started, "find request");

    Ok(future.await.map_err(StoreError::Fetch)?)
  }
}

impl Store {
  /// Create a store owning the models `schema` includes; every other model
  /// name goes through the same adapter as plain data.
  pub fn new(schema: Arc<dyn Schema>, adapter: Arc<dyn Adapter>) -> Self {
    Self::builder(schema, adapter).build()
  }

  pub fn builder(schema: Arc<dyn Schema>, adapter: Arc<dyn Adapter>) -> StoreBuilder {
    StoreBuilder {
      schema,
      adapter,
      serializer: Arc::new(JsonApiSerializer),
      fallback: None,
      query_stale_time: None,
    }
  }

  /// Build a store with the HTTP adapter, the JSON:API serializer and the
  /// configured schema descriptor.
  pub fn from_config(config: &Config) -> Result<Self> {
    let schema = DescriptorSchema::compile(config.schema.clone())?;
    let adapter = HttpAdapter::new(&config.adapter)?;
    let mut builder = Self::builder(Arc::new(schema), Arc::new(adapter));
    if let Some(stale_time) = config.query_stale_time() {
      builder = builder.query_stale_time(stale_time);
    }
    Ok(builder.build())
  }

  pub fn resolver(&self) -> &SchemaResolver {
    &self.shared.resolver
  }

  /// True if the schema or the fallback layer knows the model name.
  pub fn has_model_for(&self, model_name: &str) -> bool {
    self.shared.resolver.includes_model(model_name) || self.shared.fallback.has_model(model_name)
  }

  pub fn dispatch(&self, model_name: &str) -> Dispatch {
    self.shared.resolver.dispatch(model_name)
  }

  pub fn model_factory_for(&self, model_name: &str) -> ModelFactory {
    if self.dispatch(model_name).is_owned() {
      ModelFactory::Schema
    } else {
      ModelFactory::Plain
    }
  }

  pub fn adapter_for(&self, model_name: &str) -> Arc<dyn Adapter> {
    self.shared.adapter_for(model_name)
  }

  pub fn serializer_for(&self, model_name: &str) -> Arc<dyn Serializer> {
    self.shared.serializer_for(model_name)
  }

  /// Number of canonical records in the identity index.
  pub fn record_count(&self) -> usize {
    self.shared.index().len()
  }

  /// Find or allocate the record for `(model_name, id)` and merge `data` into it.
  ///
  /// Fails with [`StoreError::IdentityConflict`] if the id is bound to a
  /// different record under a sub-type alias.
  pub fn build_record(&self, model_name: &str, id: &str, data: Map<String, Value>) -> Result<Record> {
    self.shared.build_record(model_name, id, data)
  }

  /// Create or update the record described by `document`.
  pub fn push_document(&self, document: ResourceDocument) -> Result<Record> {
    self.shared.push_document(document)
  }

  /// Normalize a raw payload with the serializer for `model_name` and push it.
  pub fn push_payload(&self, model_name: &str, payload: Value) -> Result<QueryData> {
    let normalized = self
      .shared
      .serializer_for(model_name)
      .normalize_response(model_name, payload)?;
    self.shared.push_normalized(normalized)
  }

  /// Unload a record: remove it from every index and invalidate its projections.
  pub fn destroy_record(&self, record: &Record) {
    let key = RecordKey::new(record.model_name(), record.id());
    let removed = {
      let mut index = self.shared.index();
      match index.lookup(&key, &key) {
        Ok(Some(indexed)) if indexed.ptr_eq(record) => index.remove(&key),
        _ => None,
      }
    };
    let prefix = fetch_key(record.model_name(), record.id(), Some(""));
    let abandoned = self.shared.finds.abandon_where(|k| k.starts_with(&prefix));
    record.destroy();
    debug!(
      model = record.model_name(),
      id = record.id(),
      indexed = removed.is_some(),
      abandoned,
      "record destroyed"
    );
  }

  /// Look up without fetching. A projection is returned only once its
  /// attributes have been loaded.
  pub fn peek_record(&self, model_name: &str, id: &str) -> Option<Model> {
    let record = match self.shared.lookup(model_name, id) {
      Ok(record) => record?,
      Err(e) => {
        warn!(model_name, id, error = %e, "peek failed");
        return None;
      }
    };
    if self.shared.resolver.is_projection(model_name) {
      record
        .is_projection_loaded(model_name)
        .then(|| Model::Projection(record.projection(model_name)))
    } else {
      Some(Model::Record(record))
    }
  }

  /// Find a record or projection, fetching it if it is not loaded yet.
  ///
  /// For projection names the base record is fetched with
  /// `adapter_options.projection_name` set, and the result is a projection
  /// bound to it. Requests for the same record and projection that overlap
  /// share one fetch.
  pub async fn find_record(&self, model_name: &str, id: &str, mut options: FindOptions) -> Result<Model> {
    let shared = &self.shared;
    let projection = shared
      .resolver
      .is_projection(model_name)
      .then(|| model_name.to_string());

    if !options.reload {
      if let Some(record) = shared.lookup(model_name, id)? {
        let loaded = match &projection {
          Some(projection) => record.is_projection_loaded(projection),
          None => record.is_loaded(),
        };
        if loaded {
          debug!(model_name, id, "find served from cache");
          return Ok(Self::model_for(record, projection.as_deref()));
        }
      }
    }

    if let Some(projection) = &projection {
      options.adapter_options.projection_name = Some(projection.clone());
    }
    let base = shared.resolver.resolve_model_name(model_name);
    let record = shared
      .fetch(&base, id, projection.as_deref(), options)
      .await?;
    if record.is_destroyed() {
      return Err(StoreError::Destroyed {
        model_name: record.model_name().to_string(),
        id: id.to_string(),
      }
      .into());
    }
    Ok(Self::model_for(record, projection.as_deref()))
  }

  fn model_for(record: Record, projection: Option<&str>) -> Model {
    match projection {
      Some(projection) => Model::Projection(record.projection(projection)),
      None => Model::Record(record),
    }
  }

  /// Query an arbitrary URL. Identical queries share one request and are
  /// served from the query cache until unloaded.
  pub async fn query_url(&self, url: &str, options: QueryOptions) -> Result<QueryResult<QueryData>> {
    let shared = Arc::clone(&self.shared);
    let request_url = url.to_string();
    let method = options.method;
    let params = options.params.clone();

    self
      .shared
      .queries
      .query_url(url, &options, move || async move {
        let payload = shared.adapter.ajax(&request_url, method, &params).await?;
        // URL queries are not tied to a model name
        let normalized = shared.serializer.normalize_response("", payload)?;
        Ok::<_, Report>(shared.push_normalized(normalized)?)
      })
      .await
  }

  /// Drop a cached query result. Records it loaded stay in the cache.
  pub fn unload_url(&self, cache_key: &str) -> bool {
    self.shared.queries.unload(cache_key)
  }

  pub fn contains_url(&self, cache_key: &str) -> bool {
    self.shared.queries.contains(cache_key)
  }
}
