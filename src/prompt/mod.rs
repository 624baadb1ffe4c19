//! Versioned prompt template bundles.
//!
//! Two schema bundles ship with the crate: `v1` discovers fields freely,
//! `v2` is name-constrained and drives predefined mode. A third bundle
//! covers code generation and repair. Templates are embedded at compile
//! time; the only substitution in the schema bundles is
//! `{{previous_schema_json}}`.

use crate::error::Result;
use crate::schema::Schema;

const V1_SYSTEM: &str = include_str!("templates/v1/system_message.txt");
const V1_BASE: &str = include_str!("templates/v1/base_prompt.txt");
const V1_EXTRACTION: &str = include_str!("templates/v1/extraction_task.txt");
const V1_REFINEMENT: &str = include_str!("templates/v1/refinement_task.txt");

const V2_SYSTEM: &str = include_str!("templates/v2/system_message.txt");
const V2_BASE: &str = include_str!("templates/v2/base_prompt.txt");
const V2_EXTRACTION: &str = include_str!("templates/v2/extraction_task.txt");
const V2_REFINEMENT: &str = include_str!("templates/v2/refinement_task.txt");

const CODE_SYSTEM: &str = include_str!("templates/code/system_message.txt");
const CODE_GENERATE: &str = include_str!("templates/code/generate.txt");
const CODE_REPAIR: &str = include_str!("templates/code/repair.txt");

const PREVIOUS_SCHEMA_VAR: &str = "{{previous_schema_json}}";

/// Which schema template bundle a run uses. Fixed per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVersion {
    /// Schema-free discovery.
    V1,
    /// Name-constrained; used for predefined mode.
    V2,
}

/// Renders schema-phase prompts from the selected bundle.
#[derive(Debug, Clone, Copy)]
pub struct Prompter {
    version: PromptVersion,
}

impl Prompter {
    pub fn new(version: PromptVersion) -> Self {
        Self { version }
    }

    pub fn system_message(&self) -> &'static str {
        match self.version {
            PromptVersion::V1 => V1_SYSTEM,
            PromptVersion::V2 => V2_SYSTEM,
        }
    }

    /// First-round prompt with no prior schema.
    pub fn discovery_prompt(&self, simplified_html: &str) -> String {
        let (base, task) = match self.version {
            PromptVersion::V1 => (V1_BASE, V1_EXTRACTION),
            PromptVersion::V2 => (V2_BASE, V2_EXTRACTION),
        };
        format!("{base}\n\n## Document\n\n```html\n{simplified_html}\n```\n\n{task}")
    }

    /// Prompt for every later round, seeded with the accumulated schema.
    pub fn refinement_prompt(&self, previous: &Schema, simplified_html: &str) -> Result<String> {
        let (base, task) = match self.version {
            PromptVersion::V1 => (V1_BASE, V1_REFINEMENT),
            PromptVersion::V2 => (V2_BASE, V2_REFINEMENT),
        };
        let task = task.replace(PREVIOUS_SCHEMA_VAR, &previous.to_pretty_json()?);
        Ok(format!(
            "{base}\n\n## Document\n\n```html\n{simplified_html}\n```\n\n{task}"
        ))
    }
}

/// Renders code-phase prompts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodePrompter;

impl CodePrompter {
    pub fn system_message(&self) -> &'static str {
        CODE_SYSTEM
    }

    pub fn generate_prompt(&self, schema: &Schema, exemplar_html: &str) -> Result<String> {
        Ok(CODE_GENERATE
            .replace("{{schema_json}}", &schema.to_pretty_json()?)
            .replace("{{exemplar_html}}", exemplar_html))
    }

    pub fn repair_prompt(&self, previous_program: &str, failure_report: &str) -> String {
        CODE_REPAIR
            .replace("{{previous_program}}", previous_program)
            .replace("{{failure_report}}", failure_report)
    }
}
