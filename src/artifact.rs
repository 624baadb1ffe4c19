//! The synthesized extraction program.
//!
//! The model emits extractors in a small declarative JSON dialect: one
//! pipeline of steps per field, interpreted natively by the executor.
//! Keeping the artifact declarative makes it deterministic, cheap to
//! sandbox, and safe to rerun across a corpus without embedding a
//! scripting runtime.

use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::extract_json;

/// Native file extension of a persisted artifact.
pub const ARTIFACT_EXTENSION: &str = "json";

/// One step of a field pipeline. Pipelines run left to right starting
/// from the whole document; selection steps narrow to elements, text/attr
/// steps turn elements into strings, and the string steps post-process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// First element matching a CSS selector.
    Select { selector: String },
    /// Every element matching a CSS selector.
    SelectAll { selector: String },
    /// Trimmed text content of the selection.
    Text,
    /// An attribute value of the selection.
    Attr { name: String },
    /// Keep one capture group of the first regex match.
    Regex {
        pattern: String,
        #[serde(default)]
        group: usize,
    },
    /// Keep the n-th item of a list.
    Index { index: usize },
    /// Join a list of strings into one.
    Join {
        #[serde(default = "default_join_sep")]
        sep: String,
    },
    /// Trim surrounding whitespace.
    Trim,
    /// A fixed string, independent of the page.
    Literal { value: String },
}

fn default_join_sep() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldProgram {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProgram {
    pub fields: IndexMap<String, FieldProgram>,
}

/// A validated extraction program plus its canonical serialized form.
#[derive(Debug, Clone)]
pub struct Artifact {
    source: String,
    program: ExtractionProgram,
}

impl Artifact {
    /// Parse an artifact out of a text blob (typically a raw model reply;
    /// markdown fences and surrounding chatter are tolerated).
    pub fn from_source(blob: &str) -> Result<Self> {
        let value = extract_json(blob)?;
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        let program: ExtractionProgram = serde_json::from_value(value)
            .map_err(|e| PipelineError::Parse(format!("not an extraction program: {e}")))?;
        Self::from_program(program)
    }

    pub fn from_program(program: ExtractionProgram) -> Result<Self> {
        validate(&program)?;
        let source = serde_json::to_string_pretty(&program)
            .map_err(|e| PipelineError::Internal(format!("failed to serialize program: {e}")))?;
        Ok(Self { source, program })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let blob = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_source(&blob)
    }

    /// Load from either a file path or an in-memory blob. Short inputs
    /// that name an existing file are read from disk; everything else is
    /// treated as program source.
    pub fn load_flexible(input: &str) -> Result<Self> {
        let looks_like_path = input.len() < 4096 && !input.trim_start().starts_with(['{', '[']);
        if looks_like_path {
            let path = Path::new(input.trim());
            if path.is_file() {
                return Self::from_path(path);
            }
            return Err(PipelineError::Config(format!(
                "artifact path does not exist: {input}"
            )));
        }
        Self::from_source(input)
    }

    /// Canonical serialized form, suitable for persistence.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn program(&self) -> &ExtractionProgram {
        &self.program
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.program.fields.keys()
    }
}

/// Reject programs with selectors or regexes that will not compile, so
/// load failures are distinguishable from runtime faults.
fn validate(program: &ExtractionProgram) -> Result<()> {
    if program.fields.is_empty() {
        return Err(PipelineError::Parse(
            "extraction program has no fields".to_string(),
        ));
    }
    for (field, field_program) in &program.fields {
        for step in &field_program.steps {
            match step {
                Step::Select { selector } | Step::SelectAll { selector } => {
                    Selector::parse(selector).map_err(|e| {
                        PipelineError::Parse(format!(
                            "field '{field}': invalid selector '{selector}': {e}"
                        ))
                    })?;
                }
                Step::Regex { pattern, .. } => {
                    Regex::new(pattern).map_err(|e| {
                        PipelineError::Parse(format!(
                            "field '{field}': invalid regex '{pattern}': {e}"
                        ))
                    })?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}
