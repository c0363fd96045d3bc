//! Canonical records and the values read from them.

mod attribute;
mod model;
mod observers;

pub use attribute::{Attribute, Model};
pub use model::Record;
pub use observers::ObserverId;

pub(crate) use attribute::walk_path;
pub(crate) use model::RecordInner;
pub(crate) use observers::Observers;
