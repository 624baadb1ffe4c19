//! Error types for the extraction pipeline.
//!
//! Every failure surfaced by the library is a [`PipelineError`]. The CLI
//! wraps these in `anyhow` for display; library callers can match on the
//! kind to decide between retrying, surfacing partial progress, and
//! aborting.

use std::path::PathBuf;

use thiserror::Error;

use crate::executor::ExtractError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration or corpus input. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failure at the corpus or run-directory level. Fatal.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document could not be fetched or simplified.
    #[error("fetch failed for '{target}': {reason}")]
    Fetch { target: String, reason: String },

    /// Layout clustering failed.
    #[error("clustering failed: {0}")]
    Cluster(String),

    /// Transport-level model failure (network, 5xx, rate limit).
    /// Retried up to the per-round limit before a round is failed.
    #[error("model call failed: {0}")]
    Model(String),

    /// The model replied but its output could not be parsed into the
    /// expected shape. Retried like `Model`.
    #[error("malformed model output: {0}")]
    Parse(String),

    /// A returned schema could not be merged into the accumulated one.
    #[error("schema merge failed: {0}")]
    SchemaMerge(String),

    /// The code phase exhausted its repair budget without a passing
    /// extraction program.
    #[error("code generation failed: {0}")]
    CodeGeneration(String),

    /// An extraction program faulted at runtime.
    #[error(transparent)]
    Executor(#[from] ExtractError),

    /// A call class exceeded its configured deadline.
    #[error("'{what}' exceeded its deadline of {ms} ms")]
    Timeout { what: String, ms: u64 },

    /// The caller's cancellation signal fired. Fatal; partial progress
    /// already produced is retained by the surrounding phase result.
    #[error("operation cancelled")]
    Cancelled,

    /// A broken invariant inside the pipeline itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors that are retried locally inside a round.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Model(_) | Self::Parse(_))
    }

    /// Short machine-readable kind, used when recording per-phase error
    /// entries in structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
            Self::Fetch { .. } => "fetch",
            Self::Cluster(_) => "cluster",
            Self::Model(_) => "model",
            Self::Parse(_) => "parse",
            Self::SchemaMerge(_) => "schema_merge",
            Self::CodeGeneration(_) => "code_generation",
            Self::Executor(_) => "executor",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}
