use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use super::*;
use crate::query::CacheSource;
use crate::record::Attribute;
use crate::testing::*;

const VEHICLE: &str = "com.example.models.Vehicle";
const CAR: &str = "com.example.models.Car";
const COMPANY: &str = "com.example.models.Company";

fn value_at(model: &Model, path: &str) -> Option<Value> {
  model.get_path(path).and_then(|a| a.as_value().cloned())
}

fn compact_payload() -> Value {
  with_projection_types(
    "1",
    json!({ "name": "Tom Dale", "address": { "street": "Main St", "country": "US" } }),
    &[COMPACT_PERSON],
  )
}

fn pushed(store: &Store, payload: Value) -> Record {
  store.push_payload(PERSON, payload).unwrap().records()[0].clone()
}

#[tokio::test]
async fn test_projection_find_fetches_once() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);
  pushed(&store, initial_payload());

  let compact = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 1);
  assert_eq!(compact.model_name(), COMPACT_PERSON);

  let (model_name, id, options) = adapter.find_calls().remove(0);
  assert_eq!(model_name, PERSON);
  assert_eq!(id, "1");
  assert_eq!(
    options.adapter_options.projection_name.as_deref(),
    Some(COMPACT_PERSON)
  );

  let again = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 1);
  assert!(again.as_projection().unwrap().ptr_eq(compact.as_projection().unwrap()));
}

#[tokio::test]
async fn test_caller_adapter_options_are_kept() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);

  let mut options = FindOptions::default();
  options
    .adapter_options
    .extra
    .insert("include".to_string(), json!("address"));
  store.find_record(COMPACT_PERSON, "1", options).await.unwrap();

  let (_, _, sent) = adapter.find_calls().remove(0);
  assert_eq!(sent.adapter_options.extra.get("include"), Some(&json!("address")));
  assert_eq!(
    sent.adapter_options.projection_name.as_deref(),
    Some(COMPACT_PERSON)
  );
}

#[tokio::test]
async fn test_concurrent_finds_share_one_fetch() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);

  let (a, b) = futures::join!(
    store.find_record(COMPACT_PERSON, "1", FindOptions::default()),
    store.find_record(COMPACT_PERSON, "1", FindOptions::default()),
  );
  let (a, b) = (a.unwrap(), b.unwrap());

  assert_eq!(adapter.find_count(), 1);
  assert!(a.record().unwrap().ptr_eq(&b.record().unwrap()));
  assert_eq!(b.get_value("name"), Some(json!("Tom Dale")));
}

#[tokio::test]
async fn test_projections_share_one_record() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);

  let compact = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  let address_only = compact.record().unwrap().projection(ADDRESS_ONLY);
  assert!(address_only.parent().unwrap().ptr_eq(&compact.record().unwrap()));

  compact.set("address", json!({ "street": "Main St", "country": "NL" }));
  assert_eq!(
    address_only
      .get_path("address.country")
      .and_then(|a| a.as_value().cloned()),
    Some(json!("NL"))
  );
  assert_eq!(value_at(&compact, "address.country"), Some(json!("NL")));
  // Excluded through this projection
  assert!(address_only.get("name").is_none());
}

#[tokio::test]
async fn test_inclusion_filtering() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let record = pushed(&store, initial_payload());
  let compact = Model::Projection(record.projection(COMPACT_PERSON));

  assert_eq!(compact.get_value("name"), Some(json!("Tom Dale")));
  assert!(compact.get("description").is_none());

  compact.set("description", "overwritten");
  assert_eq!(
    record.get_value("description"),
    Some(json!("JavaScript thinkfluencer"))
  );
}

#[tokio::test]
async fn test_write_through_notifies_each_view_once() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);
  pushed(&store, initial_payload());

  let compact = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  let base = store.peek_record(PERSON, "1").unwrap();
  let address_only = Model::Projection(base.record().unwrap().projection(ADDRESS_ONLY));

  let base_name = watch_property(&base, "name");
  let compact_name = watch_property(&compact, "name");
  let address_name = watch_property(&address_only, "name");

  compact.set("name", "Yehuda Katz");

  assert_eq!(base.get_value("name"), Some(json!("Yehuda Katz")));
  assert_eq!(compact.get_value("name"), Some(json!("Yehuda Katz")));
  assert_eq!(base_name.load(Ordering::SeqCst), 1);
  assert_eq!(compact_name.load(Ordering::SeqCst), 1);
  assert_eq!(address_name.load(Ordering::SeqCst), 0);

  // Writing the same value again is not a change
  base.set("name", "Yehuda Katz");
  assert_eq!(compact_name.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refetch_of_base_updates_projections() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  adapter.respond_find(json!({
    "data": {
      "id": "1",
      "type": PERSON,
      "attributes": { "name": "Yehuda Katz", "description": "Rust and Ember" }
    }
  }));
  let store = person_store(&adapter);
  pushed(&store, initial_payload());

  let compact = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  let renamed = watch_property(&compact, "name");
  let described = watch_property(&compact, "description");

  let base = store
    .find_record(PERSON, "1", FindOptions::reload())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 2);

  assert_eq!(compact.get_value("name"), Some(json!("Yehuda Katz")));
  assert!(compact.get("description").is_none());
  assert_eq!(base.get_value("description"), Some(json!("Rust and Ember")));
  assert_eq!(renamed.load(Ordering::SeqCst), 1);
  assert_eq!(described.load(Ordering::SeqCst), 0);
  // Attributes absent from the new payload are kept
  assert_eq!(value_at(&compact, "address.country"), Some(json!("US")));
}

#[tokio::test]
async fn test_nested_attributes_follow_projection_types() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let record = pushed(&store, initial_payload());
  let base = Model::Record(record.clone());
  let compact = Model::Projection(record.projection(COMPACT_PERSON));

  assert_eq!(value_at(&compact, "address.country"), Some(json!("US")));
  assert!(compact.get_path("address.street").is_none());
  assert_eq!(value_at(&base, "address.street"), Some(json!("Main St")));

  let address = compact.get("address").unwrap();
  assert_eq!(
    address.as_projection().unwrap().projection_name(),
    "com.example.projections.CompactAddress"
  );
}

#[tokio::test]
async fn test_nested_write_merges_into_same_identity() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let record = pushed(&store, initial_payload());
  let base = Model::Record(record.clone());
  let nested = record.get("address").unwrap().as_record().cloned().unwrap();

  base.set("address", json!({ "country": "NL" }));
  assert_eq!(value_at(&base, "address.street"), Some(json!("Main St")));
  assert_eq!(value_at(&base, "address.country"), Some(json!("NL")));
  assert!(record.get("address").unwrap().as_record().unwrap().ptr_eq(&nested));

  // A different identity replaces the nested record
  base.set("address", json!({ "id": "a2", "country": "BE" }));
  assert!(nested.is_destroyed());
  assert!(value_at(&base, "address.street").is_none());
  assert_eq!(value_at(&base, "address.country"), Some(json!("BE")));
}

#[tokio::test]
async fn test_nested_record_with_identity_is_indexed() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let record = pushed(
    &store,
    json!({
      "data": {
        "id": "1",
        "type": PERSON,
        "attributes": {
          "employer": { "id": "9", "type": COMPANY, "name": "Tilde" }
        }
      }
    }),
  );

  let employer = record.get("employer").unwrap().as_record().cloned().unwrap();
  assert!(!employer.is_embedded());
  let peeked = store.peek_record(COMPANY, "9").unwrap();
  assert!(peeked.record().unwrap().ptr_eq(&employer));
  assert_eq!(peeked.get_value("name"), Some(json!("Tilde")));
}

fn person_with_employer() -> Value {
  json!({
    "data": {
      "id": "1",
      "type": PERSON,
      "attributes": {
        "employer": { "id": "9", "type": COMPANY, "name": "Tilde" }
      }
    }
  })
}

#[test]
fn test_nested_identity_indexed_on_push() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  pushed(&store, person_with_employer());

  let company = store.peek_record(COMPANY, "9").unwrap();
  assert_eq!(company.get_value("name"), Some(json!("Tilde")));

  let colleague = store
    .build_record(
      PERSON,
      "2",
      json!({ "employer": "urn:com.example.models.Company:9" })
        .as_object()
        .cloned()
        .unwrap(),
    )
    .unwrap();
  assert!(colleague
    .get("employer")
    .unwrap()
    .as_record()
    .unwrap()
    .ptr_eq(&company.record().unwrap()));
}

#[test]
fn test_reading_nested_keeps_newer_data() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let person = pushed(&store, person_with_employer());
  let company = store.peek_record(COMPANY, "9").unwrap();
  let renamed = watch_property(&company, "name");

  store
    .push_document(ResourceDocument::new(
      COMPANY,
      "9",
      json!({ "name": "Tilde Inc" }).as_object().cloned().unwrap(),
    ))
    .unwrap();
  assert_eq!(renamed.load(Ordering::SeqCst), 1);

  let employer = person.get("employer").unwrap().as_record().cloned().unwrap();
  assert!(employer.ptr_eq(&company.record().unwrap()));
  assert_eq!(employer.get_value("name"), Some(json!("Tilde Inc")));
  assert_eq!(renamed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroyed_nested_record_is_resolved_again() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let person = pushed(&store, person_with_employer());
  let shared = person.get("employer").unwrap().as_record().cloned().unwrap();

  store.destroy_record(&shared);

  let employer = person.get("employer").unwrap().as_record().cloned().unwrap();
  assert!(!employer.ptr_eq(&shared));
  assert!(!employer.is_destroyed());
  assert_eq!(employer.get_value("name"), Some(json!("Tilde")));
}

#[tokio::test]
async fn test_response_without_requested_id() {
  let adapter = MockAdapter::new();
  adapter.respond_find(json!({
    "data": { "id": "2", "type": PERSON, "attributes": { "name": "Yehuda Katz" } }
  }));
  let store = person_store(&adapter);

  let err = store
    .find_record(PERSON, "1", FindOptions::default())
    .await
    .unwrap_err();
  assert!(err.to_string().contains("no record"));
  assert!(store.peek_record(PERSON, "1").is_none());

  store
    .find_record(PERSON, "1", FindOptions::default())
    .await
    .unwrap_err();
  assert_eq!(adapter.find_count(), 2);
}

#[tokio::test]
async fn test_destroy_abandons_pending_find() {
  let adapter = MockAdapter::new();
  adapter.respond_find(initial_payload());
  let store = person_store(&adapter);
  let record = store.build_record(PERSON, "1", Map::new()).unwrap();

  let first = store.find_record(PERSON, "1", FindOptions::default());
  futures::pin_mut!(first);
  assert!(futures::poll!(first.as_mut()).is_pending());
  assert_eq!(adapter.find_count(), 1);

  store.destroy_record(&record);
  let second = store.find_record(PERSON, "1", FindOptions::default());
  let (first, second) = futures::join!(first, second);
  let (first, second) = (first.unwrap(), second.unwrap());

  assert_eq!(adapter.find_count(), 2);
  assert!(!first.record().unwrap().ptr_eq(&record));
  assert!(first.record().unwrap().ptr_eq(&second.record().unwrap()));
}

#[tokio::test]
async fn test_peek_projection_only_after_load() {
  let adapter = MockAdapter::new();
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);
  pushed(&store, initial_payload());

  assert!(store.peek_record(PERSON, "1").is_some());
  assert!(store.peek_record(COMPACT_PERSON, "1").is_none());
  assert!(store.peek_record(PERSON, "2").is_none());

  store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  let compact = store.peek_record(COMPACT_PERSON, "1").unwrap();
  assert_eq!(compact.model_name(), COMPACT_PERSON);
}

#[tokio::test]
async fn test_projection_load_does_not_load_base() {
  let adapter = MockAdapter::new();
  adapter.respond_find(initial_payload());
  let store = person_store(&adapter);
  let record = pushed(&store, compact_payload());

  assert!(record.is_projection_loaded(COMPACT_PERSON));
  assert!(!record.is_loaded());
  assert!(store.peek_record(COMPACT_PERSON, "1").is_some());

  store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 0);

  let base = store
    .find_record(PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 1);
  assert!(base.record().unwrap().ptr_eq(&record));
  assert!(record.is_loaded());
}

#[tokio::test]
async fn test_failed_fetch_is_retried() {
  let adapter = MockAdapter::new();
  adapter.fail_find("connection reset");
  adapter.respond_find(compact_payload());
  let store = person_store(&adapter);

  let err = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(
    err.downcast_ref::<StoreError>(),
    Some(StoreError::Fetch(_))
  ));
  assert!(err.to_string().contains("connection reset"));

  let compact = store
    .find_record(COMPACT_PERSON, "1", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 2);
  assert_eq!(compact.get_value("name"), Some(json!("Tom Dale")));
}

#[tokio::test]
async fn test_missing_record_in_response() {
  let adapter = MockAdapter::new();
  adapter.respond_find(json!({ "data": null }));
  let store = person_store(&adapter);

  let err = store
    .find_record(PERSON, "1", FindOptions::default())
    .await
    .unwrap_err();
  assert!(err.to_string().contains("no record"));
}

#[tokio::test]
async fn test_sub_type_aliases_follow_primary() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);

  let mut document = ResourceDocument::new(VEHICLE, "7", Map::new());
  document.sub_types = vec![CAR.to_string()];
  let vehicle = store.push_document(document).unwrap();

  let car = store.peek_record(CAR, "7").unwrap();
  assert!(car.record().unwrap().ptr_eq(&vehicle));
  store
    .find_record(CAR, "7", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(adapter.find_count(), 0);

  store.destroy_record(&vehicle);
  assert!(store.peek_record(CAR, "7").is_none());
  assert!(store.peek_record(VEHICLE, "7").is_none());
  assert_eq!(store.record_count(), 0);
}

#[test]
fn test_sub_type_bound_elsewhere_conflicts() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let car = store.build_record(CAR, "8", Map::new()).unwrap();

  let mut document = ResourceDocument::new(VEHICLE, "8", Map::new());
  document.sub_types = vec![CAR.to_string()];
  let err = store.push_document(document).unwrap_err();

  assert!(matches!(
    err.downcast_ref::<StoreError>(),
    Some(StoreError::IdentityConflict { .. })
  ));
  // Nothing was allocated for the failed push
  assert!(store.peek_record(VEHICLE, "8").is_none());
  assert!(store.peek_record(CAR, "8").unwrap().record().unwrap().ptr_eq(&car));
}

#[test]
fn test_conflicting_payload_changes_nothing() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  store.build_record(CAR, "8", Map::new()).unwrap();

  let err = store
    .push_payload(
      VEHICLE,
      json!({
        "data": { "id": "8", "type": VEHICLE, "subTypes": [CAR] },
        "included": [{ "id": "5", "type": PERSON, "attributes": { "name": "Tom Dale" } }]
      }),
    )
    .unwrap_err();

  assert!(matches!(
    err.downcast_ref::<StoreError>(),
    Some(StoreError::IdentityConflict { .. })
  ));
  assert!(store.peek_record(PERSON, "5").is_none());
  assert_eq!(store.record_count(), 1);
}

#[test]
fn test_same_id_across_models() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let person = store.build_record(PERSON, "1", Map::new()).unwrap();
  let book = store.build_record(BOOK, "1", Map::new()).unwrap();

  assert!(!person.ptr_eq(&book));
  assert_eq!(store.record_count(), 2);
}

#[tokio::test]
async fn test_references_resolve_lazily() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let record = store
    .build_record(
      PERSON,
      "1",
      json!({
        "favoriteBook": "isbn:9780439708180",
        "bestFriend": "urn:com.example.models.Person:2",
        "mentor": "urn:3",
        "otherBooksInSeries": ["isbn:1", "isbn:2"]
      })
      .as_object()
      .cloned()
      .unwrap(),
    )
    .unwrap();

  let favorite = record.get("favoriteBook").unwrap();
  assert!(matches!(favorite, Attribute::Unresolved(_)));
  assert_eq!(favorite.target_id(), Some("isbn:9780439708180"));

  let book = store
    .build_record(BOOK, "isbn:9780439708180", Map::new())
    .unwrap();
  assert!(record
    .get("favoriteBook")
    .unwrap()
    .as_record()
    .unwrap()
    .ptr_eq(&book));

  let friend = store.build_record(PERSON, "2", Map::new()).unwrap();
  assert!(record
    .get("bestFriend")
    .unwrap()
    .as_record()
    .unwrap()
    .ptr_eq(&friend));

  // Typeless references resolve by id while it is unambiguous
  assert!(matches!(record.get("mentor"), Some(Attribute::Unresolved(_))));
  let mentor = store.build_record(PERSON, "urn:3", Map::new()).unwrap();
  assert!(record.get("mentor").unwrap().as_record().unwrap().ptr_eq(&mentor));
  store.build_record(BOOK, "urn:3", Map::new()).unwrap();
  assert!(matches!(record.get("mentor"), Some(Attribute::Unresolved(_))));

  store.build_record(BOOK, "isbn:1", Map::new()).unwrap();
  let series = record.get("otherBooksInSeries").unwrap();
  let series = series.as_list().unwrap();
  assert_eq!(series.len(), 2);
  assert!(series[0].as_record().is_some());
  assert!(matches!(series[1], Attribute::Unresolved(_)));
}

#[tokio::test]
async fn test_fallback_layer_handles_unowned_models() {
  let adapter = MockAdapter::new();
  let legacy = MockAdapter::new();
  legacy.respond_find(json!({
    "data": {
      "id": "1",
      "type": "legacy-user",
      "attributes": { "address": { "street": "Main St" } }
    }
  }));
  let schema = DescriptorSchema::from_yaml(PERSON_SCHEMA).unwrap();
  let store = Store::builder(Arc::new(schema), adapter.clone())
    .fallback(DataLayer::new(legacy.clone(), Arc::new(JsonApiSerializer)).with_models(["legacy-user"]))
    .build();

  assert!(store.has_model_for("legacy-user"));
  assert!(store.has_model_for(PERSON));
  assert!(!store.has_model_for("unknown"));
  assert_eq!(store.dispatch("legacy-user"), Dispatch::Fallback("legacy-user".to_string()));
  assert_eq!(store.dispatch(COMPACT_PERSON), Dispatch::Owned(PERSON.to_string()));
  assert_eq!(store.model_factory_for("legacy-user"), ModelFactory::Plain);
  assert_eq!(store.model_factory_for(COMPACT_PERSON), ModelFactory::Schema);

  let user = store
    .find_record("legacy-user", "1", FindOptions::default())
    .await
    .unwrap();
  assert_eq!(legacy.find_count(), 1);
  assert_eq!(adapter.find_count(), 0);
  assert_eq!(
    user.get_value("address"),
    Some(json!({ "street": "Main St" }))
  );
}

#[tokio::test]
async fn test_query_url_pushes_and_caches() {
  let adapter = MockAdapter::new();
  adapter.respond_query(json!({
    "data": [
      { "id": "1", "type": PERSON, "attributes": { "name": "Tom Dale" } },
      { "id": "2", "type": PERSON, "attributes": { "name": "Yehuda Katz" } }
    ]
  }));
  let store = person_store(&adapter);
  let options = QueryOptions::default().with_cache_key("people");

  let first = store.query_url("/people", options.clone()).await.unwrap();
  assert_eq!(first.source, CacheSource::Network);
  assert_eq!(first.data.records().len(), 2);

  let second = store.query_url("/people", options.clone()).await.unwrap();
  assert_eq!(second.source, CacheSource::Cache);
  assert_eq!(adapter.ajax_count(), 1);
  assert!(store.contains_url("people"));

  let tom = store.peek_record(PERSON, "1").unwrap();
  assert!(tom.record().unwrap().ptr_eq(&second.data.records()[0]));

  assert!(store.unload_url("people"));
  assert!(!store.contains_url("people"));
  // Unloading a query leaves its records alone
  assert!(store.peek_record(PERSON, "2").is_some());

  store.query_url("/people", options).await.unwrap();
  assert_eq!(adapter.ajax_count(), 2);
}

#[tokio::test]
async fn test_concurrent_queries_share_request() {
  let adapter = MockAdapter::new();
  adapter.respond_query(json!({ "data": { "id": "1", "type": PERSON } }));
  let store = person_store(&adapter);
  let options = QueryOptions::default().with_param("q", "dale");

  let (a, b) = futures::join!(
    store.query_url("/search", options.clone()),
    store.query_url("/search", options.clone()),
  );
  assert_eq!(adapter.ajax_count(), 1);
  assert!(matches!(a.unwrap().data, QueryData::One(_)));
  assert_eq!(b.unwrap().source, CacheSource::InFlight);
}

#[tokio::test]
async fn test_destroy_invalidates_projections() {
  let adapter = MockAdapter::new();
  let store = person_store(&adapter);
  let record = pushed(&store, initial_payload());
  let nested = record.get("address").unwrap().as_record().cloned().unwrap();
  let compact = record.projection(COMPACT_PERSON);

  store.destroy_record(&record);

  assert!(record.is_destroyed());
  assert!(nested.is_destroyed());
  assert!(!compact.is_valid());
  assert!(compact.get("name").is_none());
  assert!(store.peek_record(PERSON, "1").is_none());
  assert_eq!(store.record_count(), 0);

  // A later push starts a fresh record
  let fresh = pushed(&store, initial_payload());
  assert!(!fresh.ptr_eq(&record));
}

#[test]
fn test_from_config() {
  let config = Config::from_yaml(
    r#"
adapter:
  host: https://api.example.com
schema:
  includes: ['^com\.example\.']
"#,
  )
  .unwrap();
  let store = Store::from_config(&config).unwrap();

  assert!(store.has_model_for(PERSON));
  assert_eq!(store.model_factory_for("legacy-user"), ModelFactory::Plain);
}
