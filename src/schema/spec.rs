//! Schema and field specification types.

use indexmap::IndexMap;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{PipelineError, Result};

/// Declared type of an extracted field.
///
/// Model output is loose, so parsing is tolerant: unknown or absent type
/// strings become [`FieldKind::Unspecified`] rather than failing the whole
/// schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKind {
    #[default]
    Unspecified,
    String,
    Int,
    Float,
    Bool,
    Array,
    Object,
}

impl FieldKind {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" | "text" => Self::String,
            "int" | "integer" => Self::Int,
            "float" | "number" | "double" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            "array" | "list" => Self::Array,
            "object" | "map" | "dict" => Self::Object,
            _ => Self::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "",
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    pub fn is_specified(&self) -> bool {
        *self != Self::Unspecified
    }
}

impl Serialize for FieldKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Self::parse).unwrap_or_default())
    }
}

/// Declared shape of one extracted field.
///
/// `locators` are opaque node-path expressions (CSS selector strings in
/// practice); the schema layer never interprets them. The serde aliases
/// accept the looser key names models tend to emit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type", default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub description: String,
    #[serde(
        default,
        alias = "value_sample",
        deserialize_with = "string_or_seq"
    )]
    pub value_samples: Vec<String>,
    #[serde(default, alias = "xpaths", deserialize_with = "string_or_seq")]
    pub locators: Vec<String>,
    /// Recursive shape for `object`-typed fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<IndexMap<String, FieldSpec>>,
}

impl FieldSpec {
    /// Seed for a predefined field: declared type, everything else blank,
    /// one empty locator slot for the model to fill.
    pub fn seeded(type_name: &str) -> Self {
        Self {
            kind: FieldKind::parse(type_name),
            description: String::new(),
            value_samples: Vec::new(),
            locators: vec![String::new()],
            properties: None,
        }
    }

    /// Fold another observation of the same field into this one.
    ///
    /// Novel samples and locators are appended in arrival order and
    /// de-duplicated by exact string equality; the newest non-blank type
    /// and description win.
    pub fn absorb(&mut self, incoming: &FieldSpec) {
        for sample in &incoming.value_samples {
            if !self.value_samples.contains(sample) {
                self.value_samples.push(sample.clone());
            }
        }
        for locator in &incoming.locators {
            if !self.locators.contains(locator) {
                self.locators.push(locator.clone());
            }
        }
        if incoming.kind.is_specified() {
            self.kind = incoming.kind;
        }
        if !incoming.description.is_empty() {
            self.description = incoming.description.clone();
        }
        if incoming.properties.is_some() {
            self.properties = incoming.properties.clone();
        }
    }
}

/// Accept a bare string, a list of values, or null where a list of strings
/// is expected. Non-string list items are stringified.
fn string_or_seq<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    struct StringOrSeq;

    impl<'de> Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a string or a list of strings")
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            if v.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![v.to_string()])
            }
        }

        fn visit_seq<A: SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut values = Vec::new();
            while let Some(item) = seq.next_element::<serde_json::Value>()? {
                match item {
                    serde_json::Value::String(s) => values.push(s),
                    serde_json::Value::Null => {}
                    other => values.push(other.to_string()),
                }
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}

/// Mapping from field name to [`FieldSpec`], in insertion order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(pub IndexMap<String, FieldSpec>);

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a schema from a predefined `name -> type` mapping.
    pub fn from_predefined(fields: &IndexMap<String, String>) -> Self {
        Self(
            fields
                .iter()
                .map(|(name, type_name)| (name.clone(), FieldSpec::seeded(type_name)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.0.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.0.iter()
    }

    /// Merge a model-returned schema, growing the name-set. New names are
    /// appended in arrival order; known names absorb the new observation.
    pub fn merge_auto(&mut self, incoming: &Schema) {
        for (name, spec) in &incoming.0 {
            match self.0.get_mut(name) {
                Some(existing) => existing.absorb(spec),
                None => {
                    self.0.insert(name.clone(), spec.clone());
                }
            }
        }
    }

    /// Merge a model-returned schema without growing the name-set. Names
    /// outside the existing set are discarded; the count of discarded
    /// names is returned so callers can log it.
    pub fn merge_predefined(&mut self, incoming: &Schema) -> usize {
        let mut discarded = 0;
        for (name, spec) in &incoming.0 {
            match self.0.get_mut(name) {
                Some(existing) => existing.absorb(spec),
                None => discarded += 1,
            }
        }
        discarded
    }

    /// Enforce the end-of-phase invariant that every field carries at
    /// least one locator slot.
    pub fn ensure_locator_slots(&mut self) {
        for spec in self.0.values_mut() {
            if spec.locators.is_empty() {
                spec.locators.push(String::new());
            }
        }
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::Internal(format!("failed to serialize schema: {e}")))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PipelineError::Parse(format!("schema is not valid JSON: {e}")))
    }

    pub fn from_json_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| PipelineError::Parse(format!("schema has unexpected shape: {e}")))
    }
}
