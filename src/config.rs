//! Configuration file loading and validation.
//!
//! Configuration is an explicit value threaded through constructors; nothing
//! reads settings at call sites. Keys use camelCase on disk, unknown keys
//! are rejected, and every field has a default so a missing file means
//! "defaults everywhere".

use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const CONFIG_FILE_NAME: &str = ".pagesiftrc.json";

/// Items that may be listed under `save` to persist run outputs.
pub const SAVE_ITEMS: &[&str] = &["schema", "code", "data", "report", "files"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    /// Discover field names from the exemplars.
    Auto,
    /// The field name-set is fixed by `predefinedSchema` and never grows.
    Predefined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Run name; persisted outputs land under `<outputPath>/<name>/`.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_output_path")]
    pub output_path: String,
    /// Glob patterns for corpus files to skip (matched against file
    /// names).
    #[serde(default)]
    pub ignores: Vec<String>,
    /// Number of exemplars consumed by the schema phase, clamped to the
    /// corpus size at plan time.
    #[serde(default = "default_iteration_rounds")]
    pub iteration_rounds: usize,
    #[serde(default = "default_schema_mode")]
    pub schema_mode: SchemaMode,
    /// Field name to declared type, required when `schemaMode` is
    /// `predefined`.
    #[serde(default)]
    pub predefined_schema: IndexMap<String, String>,
    #[serde(default)]
    pub enable_schema_edit: bool,
    /// Stop the schema phase early when two consecutive rounds leave the
    /// merged schema unchanged.
    #[serde(default)]
    pub schema_early_stop: bool,
    #[serde(default = "default_cluster_eps")]
    pub cluster_eps: f64,
    #[serde(default = "default_cluster_min_samples")]
    pub cluster_min_samples: usize,
    /// Worker count for batch extraction; 0 means `min(8, cores)`.
    #[serde(default)]
    pub batch_workers: usize,
    #[serde(default = "default_executor_deadline_ms")]
    pub executor_deadline_ms: u64,
    /// Outputs to keep on disk (`schema`, `code`, `data`, `report`,
    /// `files`). Empty means in-memory only.
    #[serde(default)]
    pub save: Vec<String>,
    /// OpenAI-compatible chat completions endpoint.
    #[serde(default = "default_model_base_url")]
    pub model_base_url: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_name() -> String {
    "run".to_string()
}

fn default_output_path() -> String {
    "output".to_string()
}

fn default_iteration_rounds() -> usize {
    3
}

fn default_schema_mode() -> SchemaMode {
    SchemaMode::Auto
}

fn default_cluster_eps() -> f64 {
    0.3
}

fn default_cluster_min_samples() -> usize {
    2
}

fn default_executor_deadline_ms() -> u64 {
    30_000
}

fn default_model_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_model_name() -> String {
    "deepseek-chat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            output_path: default_output_path(),
            ignores: Vec::new(),
            iteration_rounds: default_iteration_rounds(),
            schema_mode: default_schema_mode(),
            predefined_schema: IndexMap::new(),
            enable_schema_edit: false,
            schema_early_stop: false,
            cluster_eps: default_cluster_eps(),
            cluster_min_samples: default_cluster_min_samples(),
            batch_workers: 0,
            executor_deadline_ms: default_executor_deadline_ms(),
            save: Vec::new(),
            model_base_url: default_model_base_url(),
            model_name: default_model_name(),
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        for pattern in &self.ignores {
            glob::Pattern::new(pattern).map_err(|e| {
                PipelineError::Config(format!("invalid glob pattern in 'ignores' \"{pattern}\": {e}"))
            })?;
        }
        if self.iteration_rounds < 1 {
            return Err(PipelineError::Config(format!(
                "iterationRounds must be at least 1, got {}",
                self.iteration_rounds
            )));
        }
        if self.schema_mode == SchemaMode::Predefined && self.predefined_schema.is_empty() {
            return Err(PipelineError::Config(
                "schemaMode 'predefined' requires a non-empty predefinedSchema".to_string(),
            ));
        }
        if !(self.cluster_eps > 0.0 && self.cluster_eps <= 1.0) {
            return Err(PipelineError::Config(format!(
                "clusterEps must be in (0, 1], got {}",
                self.cluster_eps
            )));
        }
        if self.cluster_min_samples < 1 {
            return Err(PipelineError::Config(
                "clusterMinSamples must be at least 1".to_string(),
            ));
        }
        if self.executor_deadline_ms == 0 {
            return Err(PipelineError::Config(
                "executorDeadlineMs must be positive".to_string(),
            ));
        }
        for item in &self.save {
            if !SAVE_ITEMS.contains(&item.as_str()) {
                return Err(PipelineError::Config(format!(
                    "unknown save item '{item}', expected one of: {}",
                    SAVE_ITEMS.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Effective batch worker count.
    pub fn effective_batch_workers(&self) -> usize {
        if self.batch_workers > 0 {
            self.batch_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get().min(8))
                .unwrap_or(1)
        }
    }

    pub fn should_save(&self, item: &str) -> bool {
        self.save.iter().any(|s| s == item)
    }

    /// Directory persisted outputs are written to.
    pub fn run_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_path).join(&self.name)
    }
}

pub fn default_config_json() -> Result<String> {
    serde_json::to_string_pretty(&Config::default())
        .map_err(|e| PipelineError::Internal(format!("failed to render default config: {e}")))
}

/// Walk up from `start_dir` looking for a config file, stopping at a
/// repository root.
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Some(config_path);
        }
        if current.join(".git").exists() {
            return None;
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Result of loading configuration.
pub struct ConfigLoadResult {
    pub config: Config,
    /// True if config was loaded from a file, false if using defaults.
    pub from_file: bool,
}

pub fn load_config(start_dir: &Path) -> Result<ConfigLoadResult> {
    match find_config_file(start_dir) {
        Some(path) => {
            let content = fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?;
            let config: Config = serde_json::from_str(&content).map_err(|e| {
                PipelineError::Config(format!("failed to parse {}: {e}", path.display()))
            })?;
            config.validate()?;
            Ok(ConfigLoadResult {
                config,
                from_file: true,
            })
        }
        None => Ok(ConfigLoadResult {
            config: Config::default(),
            from_file: false,
        }),
    }
}
