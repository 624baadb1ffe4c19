//! Field schema types, merge rules, persistence, and editing.
//!
//! A [`Schema`] maps field names to [`FieldSpec`]s. Field order is not
//! semantically significant but is preserved end-to-end for display and
//! serialization, so the map is an `IndexMap`.

mod edit;
mod spec;
mod store;

pub use edit::{FieldChanges, IdentityGate, SchemaEditGate, detect_field_changes, has_new_fields};
pub use spec::{FieldKind, FieldSpec, Schema};
pub use store::SchemaStore;
