//! Client-side record cache for schema-described API resources.
//!
//! The crate keeps one canonical [`Record`] per `(model, id)` and hands out
//! [`Projection`]s: restricted, possibly retyped views over a record that read
//! and write through to it. A [`Schema`] decides which model names this cache
//! owns, which attributes a projection exposes, and how references and nested
//! objects resolve. URL queries are deduplicated by the [`QueryCache`].
//!
//! ```ignore
//! let store = Store::new(schema, adapter);
//! let compact = store
//!   .find_record("com.example.projections.CompactPerson", "1", FindOptions::default())
//!   .await?;
//! assert_eq!(compact.get_value("name"), Some(json!("Tom Dale")));
//! ```

pub mod config;
mod error;
pub mod network;
mod projection;
pub mod query;
pub mod record;
pub mod schema;
mod store;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::StoreError;
pub use network::{
  Adapter, AdapterOptions, FindOptions, HttpAdapter, JsonApiSerializer, Method, NormalizedPayload,
  ResourceDocument, Serializer,
};
pub use projection::Projection;
pub use query::{CacheSource, QueryCache, QueryOptions, QueryResult};
pub use record::{Attribute, Model, ObserverId, Record};
pub use schema::{DescriptorSchema, Dispatch, NestedModel, Reference, Schema, SchemaDescriptor, SchemaResolver};
pub use store::{DataLayer, ModelFactory, QueryData, Store, StoreBuilder};
