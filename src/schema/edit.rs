//! Schema editing between the schema and code phases.
//!
//! The edit gate hands the learned schema to the caller before code
//! generation. When the edited schema introduces new field names the
//! orchestrator re-runs the schema phase in predefined mode, so locators
//! for the new fields get learned rather than guessed.

use std::path::Path;

use crate::error::Result;
use crate::schema::Schema;

/// Field-level difference between the phase output and an edited schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compare two schemas field-by-field.
///
/// Added names are reported in the edited schema's order, removed names in
/// the original's order. A common field counts as modified when any part
/// of its spec differs.
pub fn detect_field_changes(original: &Schema, edited: &Schema) -> FieldChanges {
    let mut changes = FieldChanges::default();

    for name in edited.field_names() {
        if original.get(name).is_none() {
            changes.added.push(name.clone());
        }
    }
    for (name, original_spec) in original.iter() {
        match edited.get(name) {
            None => changes.removed.push(name.clone()),
            Some(edited_spec) if edited_spec != original_spec => {
                changes.modified.push(name.clone());
            }
            Some(_) => {}
        }
    }

    changes
}

pub fn has_new_fields(original: &Schema, edited: &Schema) -> bool {
    !detect_field_changes(original, edited).added.is_empty()
}

/// Capability to mutate the learned schema between phases.
///
/// `schema_path` points at the serialized schema on disk so interactive
/// gates can hand it to an editor; programmatic gates can ignore it. The
/// call may block (e.g. waiting for a human), so gates run outside any
/// async executor thread the caller cares about.
pub trait SchemaEditGate: Send + Sync {
    fn edit(&self, schema_path: &Path, schema: &Schema) -> Result<Schema>;
}

/// The default gate: pass the schema through unchanged.
pub struct IdentityGate;

impl SchemaEditGate for IdentityGate {
    fn edit(&self, _schema_path: &Path, schema: &Schema) -> Result<Schema> {
        Ok(schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schema::FieldSpec;

    fn schema_with(names: &[&str]) -> Schema {
        let mut schema = Schema::new();
        for name in names {
            schema.0.insert(name.to_string(), FieldSpec::default());
        }
        schema
    }

    #[test]
    fn detects_added_and_removed_fields() {
        let original = schema_with(&["title", "price"]);
        let edited = schema_with(&["title", "isbn"]);

        let changes = detect_field_changes(&original, &edited);
        assert_eq!(changes.added, vec!["isbn"]);
        assert_eq!(changes.removed, vec!["price"]);
        assert!(changes.modified.is_empty());
        assert!(has_new_fields(&original, &edited));
    }

    #[test]
    fn detects_modified_fields() {
        let original = schema_with(&["title"]);
        let mut edited = schema_with(&["title"]);
        edited.0.get_mut("title").unwrap().description = "the page title".into();

        let changes = detect_field_changes(&original, &edited);
        assert!(changes.added.is_empty());
        assert!(changes.removed.is_empty());
        assert_eq!(changes.modified, vec!["title"]);
        assert!(!has_new_fields(&original, &edited));
    }

    #[test]
    fn identical_schemas_have_no_changes() {
        let schema = schema_with(&["a", "b"]);
        assert!(detect_field_changes(&schema, &schema.clone()).is_empty());
    }

    #[test]
    fn identity_gate_is_a_no_op() {
        let schema = schema_with(&["title"]);
        let edited = IdentityGate
            .edit(Path::new("unused.json"), &schema)
            .unwrap();
        assert_eq!(edited, schema);
    }
}
