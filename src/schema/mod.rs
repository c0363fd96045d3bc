//! Schema policy: which model names are owned, what projections expose, and
//! how attribute values turn into references and nested records.
//!
//! - [`Schema`] is the registered descriptor, supplied once at store
//!   construction and read-only afterwards
//! - [`SchemaResolver`] wraps it, isolates misbehaving callbacks and caches
//!   per-type dispatch decisions
//! - [`DescriptorSchema`] is a declarative, YAML-loadable implementation

mod descriptor;
mod resolver;
mod traits;

pub use descriptor::{DescriptorSchema, ModelSchema, ReferenceRule, SchemaDescriptor};
pub use resolver::{Dispatch, SchemaResolver};
pub use traits::{NestedModel, Reference, Schema};
