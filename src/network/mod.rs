//! Boundary with the network layer: adapters issue requests, serializers turn
//! raw payloads into normalized resource documents.

mod adapter;
mod document;

pub use adapter::{Adapter, AdapterOptions, FindOptions, HttpAdapter, Method};
pub use document::{JsonApiSerializer, NormalizedPayload, PrimaryData, ResourceDocument, Serializer};
