//! Phase composition and the public pipeline operations.
//!
//! The orchestrator owns the plan, the current schema, and the current
//! artifact; every other component only sees its own inputs. Operations
//! return structured results carrying either complete output or partial
//! output plus error records keyed by phase and document id — nothing here
//! retries beyond the limits the phases already enforce.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::artifact::{ARTIFACT_EXTENSION, Artifact};
use crate::batch::{BatchOutcome, BatchRunner, DocumentOutcome};
use crate::cancel::CancelFlag;
use crate::cluster::{ClusterOutcome, ClusterParams, cluster_layouts};
use crate::config::{Config, SchemaMode};
use crate::corpus::{Document, apply_ignores, doc_id, list_corpus};
use crate::error::{PipelineError, Result};
use crate::executor::{Executor, ExecutorLimits};
use crate::fetch::{FileFetcher, HtmlFetcher};
use crate::model::ModelClient;
use crate::phases::schema::RoundRecord;
use crate::phases::{CodePhase, PhaseStatus, SchemaPhase, SchemaPhaseOutcome};
use crate::prompt::{PromptVersion, Prompter};
use crate::schema::{IdentityGate, Schema, SchemaEditGate, SchemaStore, detect_field_changes};

/// One recorded failure, keyed by phase and (where applicable) document.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub kind: String,
    pub message: String,
}

impl ErrorRecord {
    fn new(phase: &str, doc_id: Option<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            phase: phase.to_string(),
            doc_id,
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// The execution plan: which documents serve as exemplars, and how many
/// learning rounds run.
#[derive(Debug, Clone)]
pub struct Plan {
    pub exemplars: Vec<String>,
    pub iteration_rounds: usize,
}

impl Plan {
    /// Take the first `rounds` documents (corpus order is stable) as
    /// exemplars, clamping to the corpus size.
    pub fn new(paths: &[PathBuf], requested_rounds: usize) -> Self {
        let iteration_rounds = requested_rounds.min(paths.len()).max(1);
        let exemplars = paths
            .iter()
            .take(iteration_rounds)
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        Self {
            exemplars,
            iteration_rounds,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExtractSchemaResult {
    pub status: PhaseStatus,
    pub final_schema: Option<Schema>,
    pub intermediate_schemas: Vec<Schema>,
    pub errors: Vec<ErrorRecord>,
}

impl ExtractSchemaResult {
    pub fn summary(&self) -> String {
        match &self.final_schema {
            Some(schema) => format!(
                "schema has {} field(s) after {} round(s)",
                schema.len(),
                self.intermediate_schemas.len()
            ),
            None => format!(
                "schema phase did not converge ({} error(s))",
                self.errors.len()
            ),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InferCodeResult {
    pub status: PhaseStatus,
    pub schema: Option<Schema>,
    pub artifact_source: Option<String>,
    pub errors: Vec<ErrorRecord>,
}

impl InferCodeResult {
    pub fn summary(&self) -> String {
        match (&self.artifact_source, &self.schema) {
            (Some(source), Some(schema)) => format!(
                "generated a {}-byte extractor for {} field(s)",
                source.len(),
                schema.len()
            ),
            _ => format!("code phase failed ({} error(s))", self.errors.len()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExtractDataResult {
    pub status: PhaseStatus,
    pub final_schema: Option<Schema>,
    pub artifact_source: Option<String>,
    pub batch: Option<BatchOutcome>,
    pub intermediate_schemas: Vec<Schema>,
    pub errors: Vec<ErrorRecord>,
}

impl ExtractDataResult {
    pub fn summary(&self) -> String {
        match (&self.batch, &self.final_schema) {
            (Some(batch), Some(schema)) => format!(
                "{} with a schema of {} field(s)",
                batch.summary(),
                schema.len()
            ),
            _ => format!("pipeline stopped early ({} error(s))", self.errors.len()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExtractWithCodeResult {
    pub batch: BatchOutcome,
    pub errors: Vec<ErrorRecord>,
}

impl ExtractWithCodeResult {
    pub fn summary(&self) -> String {
        self.batch.summary()
    }
}

/// Composes the phases into the five public operations.
pub struct Orchestrator {
    config: Config,
    model: Arc<dyn ModelClient>,
    fetcher: Arc<dyn HtmlFetcher>,
    edit_gate: Arc<dyn SchemaEditGate>,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(config: Config, model: Arc<dyn ModelClient>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            model,
            fetcher: Arc::new(FileFetcher),
            edit_gate: Arc::new(IdentityGate),
            cancel: CancelFlag::new(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn HtmlFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_edit_gate(mut self, gate: Arc<dyn SchemaEditGate>) -> Self {
        self.edit_gate = gate;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// The flag callers can fire to stop long operations.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Learn a schema from the corpus exemplars.
    pub async fn extract_schema(&self, corpus: &Path) -> Result<ExtractSchemaResult> {
        let paths = self.corpus_paths(corpus)?;
        let plan = Plan::new(&paths, self.config.iteration_rounds);

        let (outcome, mut errors) = self.run_schema_stage(&plan, None, self.config.schema_mode).await?;
        let mut final_schema = outcome.final_schema.clone();
        let mut intermediates = outcome.intermediate_schemas.clone();

        if let Some(schema) = final_schema.clone() {
            if self.config.enable_schema_edit {
                let (edited, mut edit_errors, extra_intermediates) =
                    self.apply_edit_gate(schema, &plan).await?;
                errors.append(&mut edit_errors);
                intermediates.extend(extra_intermediates);
                final_schema = Some(edited);
            }
        }

        if let (Some(schema), true) = (&final_schema, self.config.should_save("schema")) {
            self.schema_store()?.save_final(schema)?;
        }

        Ok(ExtractSchemaResult {
            status: outcome.status,
            final_schema,
            intermediate_schemas: intermediates,
            errors,
        })
    }

    /// Synthesize an extractor, learning a schema first unless one is
    /// supplied.
    pub async fn infer_code(
        &self,
        corpus: &Path,
        schema: Option<Schema>,
    ) -> Result<InferCodeResult> {
        let paths = self.corpus_paths(corpus)?;

        let (final_schema, rounds, mut errors, status) = match schema {
            Some(provided) => {
                // A supplied schema skips learning, but the exemplars still
                // run through the phase in predefined mode so the code
                // phase has per-exemplar expected values to verify against.
                let plan = Plan::new(&paths, self.config.iteration_rounds.min(3));
                let (outcome, errors) = self
                    .run_schema_stage(&plan, Some(provided.clone()), SchemaMode::Predefined)
                    .await?;
                (Some(provided), outcome.rounds, errors, outcome.status)
            }
            None => {
                let plan = Plan::new(&paths, self.config.iteration_rounds);
                let (outcome, errors) = self
                    .run_schema_stage(&plan, None, self.config.schema_mode)
                    .await?;
                (
                    outcome.final_schema.clone(),
                    outcome.rounds,
                    errors,
                    outcome.status,
                )
            }
        };

        let Some(final_schema) = final_schema else {
            return Ok(InferCodeResult {
                status,
                schema: None,
                artifact_source: None,
                errors,
            });
        };
        if status != PhaseStatus::Succeeded {
            return Ok(InferCodeResult {
                status,
                schema: Some(final_schema),
                artifact_source: None,
                errors,
            });
        }

        let (artifact, status, mut code_errors) =
            self.run_code_stage(&final_schema, &rounds).await?;
        errors.append(&mut code_errors);

        let artifact_source = artifact.map(|a| a.source().to_string());
        if let (Some(source), true) = (&artifact_source, self.config.should_save("code")) {
            self.write_parser(source)?;
        }

        Ok(InferCodeResult {
            status,
            schema: Some(final_schema),
            artifact_source,
            errors,
        })
    }

    /// The full pipeline: learn a schema, synthesize an extractor, apply
    /// it to every document.
    pub async fn extract_data(&self, corpus: &Path) -> Result<ExtractDataResult> {
        let paths = self.corpus_paths(corpus)?;
        let plan = Plan::new(&paths, self.config.iteration_rounds);

        let (outcome, mut errors) = self
            .run_schema_stage(&plan, None, self.config.schema_mode)
            .await?;
        let mut intermediates = outcome.intermediate_schemas.clone();

        let Some(mut final_schema) = outcome.final_schema.clone() else {
            return Ok(ExtractDataResult {
                status: outcome.status,
                final_schema: None,
                artifact_source: None,
                batch: None,
                intermediate_schemas: intermediates,
                errors,
            });
        };

        if self.config.enable_schema_edit {
            let (edited, mut edit_errors, extra_intermediates) =
                self.apply_edit_gate(final_schema, &plan).await?;
            errors.append(&mut edit_errors);
            intermediates.extend(extra_intermediates);
            final_schema = edited;
        }
        if self.config.should_save("schema") {
            self.schema_store()?.save_final(&final_schema)?;
        }

        let (artifact, code_status, mut code_errors) =
            self.run_code_stage(&final_schema, &outcome.rounds).await?;
        errors.append(&mut code_errors);

        // A failed code phase still surfaces its best attempt for
        // diagnostics, but nothing is batch-extracted with it.
        let artifact = match (code_status, artifact) {
            (PhaseStatus::Succeeded, Some(artifact)) => artifact,
            (_, artifact) => {
                return Ok(ExtractDataResult {
                    status: code_status,
                    final_schema: Some(final_schema),
                    artifact_source: artifact.map(|a| a.source().to_string()),
                    batch: None,
                    intermediate_schemas: intermediates,
                    errors,
                });
            }
        };
        if self.config.should_save("code") {
            self.write_parser(artifact.source())?;
        }

        let (batch, mut batch_errors) = self.run_batch_stage(&artifact, &paths).await?;
        errors.append(&mut batch_errors);
        let status = batch.status;

        Ok(ExtractDataResult {
            status,
            final_schema: Some(final_schema),
            artifact_source: Some(artifact.source().to_string()),
            batch: Some(batch),
            intermediate_schemas: intermediates,
            errors,
        })
    }

    /// Apply an existing extractor (a file path or program source) to the
    /// corpus.
    pub async fn extract_with_code(
        &self,
        corpus: &Path,
        artifact_input: &str,
    ) -> Result<ExtractWithCodeResult> {
        let artifact = Artifact::load_flexible(artifact_input)?;
        let paths = self.corpus_paths(corpus)?;

        if self.config.should_save("code") {
            self.write_parser(artifact.source())?;
        }

        let (batch, errors) = self.run_batch_stage(&artifact, &paths).await?;
        Ok(ExtractWithCodeResult { batch, errors })
    }

    /// Partition the corpus into layout clusters.
    pub async fn classify(&self, corpus: &Path) -> Result<ClusterOutcome> {
        let paths = self.corpus_paths(corpus)?;

        let mut htmls = Vec::with_capacity(paths.len());
        for path in &paths {
            htmls.push(std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?);
        }

        let params = ClusterParams {
            eps: self.config.cluster_eps,
            min_samples: self.config.cluster_min_samples,
            ..ClusterParams::default()
        };
        let labels = cluster_layouts(&htmls, &params)?;
        let ids: Vec<String> = paths.iter().map(|p| doc_id(p)).collect();
        let outcome = ClusterOutcome::from_labels(&ids, labels);

        if self.config.should_save("report") {
            let dir = self.ensure_run_dir()?;
            let path = dir.join("cluster_report.json");
            let report = serde_json::to_string_pretty(&outcome)
                .map_err(|e| PipelineError::Internal(format!("failed to render report: {e}")))?;
            std::fs::write(&path, report).map_err(|e| PipelineError::io(&path, e))?;
        }
        if self.config.should_save("files") {
            self.copy_cluster_files(&paths, &outcome)?;
        }

        Ok(outcome)
    }

    async fn run_schema_stage(
        &self,
        plan: &Plan,
        seed: Option<Schema>,
        mode: SchemaMode,
    ) -> Result<(SchemaPhaseOutcome, Vec<ErrorRecord>)> {
        let version = match mode {
            SchemaMode::Auto => PromptVersion::V1,
            SchemaMode::Predefined => PromptVersion::V2,
        };
        let mut phase = SchemaPhase::new(
            self.fetcher.clone(),
            self.model.clone(),
            Prompter::new(version),
            mode,
            self.cancel.clone(),
        )
        .with_predefined(self.config.predefined_schema.clone())
        .with_early_stop(self.config.schema_early_stop);
        if self.config.should_save("schema") {
            phase = phase.with_store(self.schema_store()?);
        }

        let outcome = phase.execute(&plan.exemplars, seed).await?;
        let errors = outcome
            .rounds
            .iter()
            .filter(|round| !round.succeeded)
            .map(|round| {
                ErrorRecord::new(
                    "schema",
                    Some(round.exemplar_id.clone()),
                    "round",
                    round.note.clone().unwrap_or_default(),
                )
            })
            .collect();
        Ok((outcome, errors))
    }

    /// Run the edit gate and, when it introduced new fields, re-run the
    /// schema phase in predefined mode seeded with the edited schema.
    async fn apply_edit_gate(
        &self,
        schema: Schema,
        plan: &Plan,
    ) -> Result<(Schema, Vec<ErrorRecord>, Vec<Schema>)> {
        let dir = self.ensure_run_dir()?;
        let edit_path = dir.join("schema_for_edit.json");
        std::fs::write(&edit_path, schema.to_pretty_json()?)
            .map_err(|e| PipelineError::io(&edit_path, e))?;

        let mut errors = Vec::new();
        let edited = match self.edit_gate.edit(&edit_path, &schema) {
            Ok(edited) => edited,
            Err(err) => {
                errors.push(ErrorRecord::new("schema_edit", None, err.kind(), err.to_string()));
                let _ = std::fs::remove_file(&edit_path);
                return Ok((schema, errors, Vec::new()));
            }
        };
        let _ = std::fs::remove_file(&edit_path);

        let changes = detect_field_changes(&schema, &edited);
        if changes.is_empty() {
            tracing::info!("schema edit made no changes");
            return Ok((edited, errors, Vec::new()));
        }
        tracing::info!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            modified = changes.modified.len(),
            "schema edited"
        );

        if changes.added.is_empty() {
            return Ok((edited, errors, Vec::new()));
        }

        // New fields have no learned locators; re-run the phase with the
        // edited schema as a frozen template to learn them.
        tracing::info!("edited schema adds fields, re-running schema phase in predefined mode");
        let (outcome, mut phase_errors) = self
            .run_schema_stage(plan, Some(edited.clone()), SchemaMode::Predefined)
            .await?;
        errors.append(&mut phase_errors);

        match outcome.final_schema {
            Some(regenerated) => Ok((regenerated, errors, outcome.intermediate_schemas)),
            None => {
                errors.push(ErrorRecord::new(
                    "schema_edit",
                    None,
                    "schema_merge",
                    "re-run after edit did not converge; using the edited schema as-is",
                ));
                Ok((edited, errors, outcome.intermediate_schemas))
            }
        }
    }

    async fn run_code_stage(
        &self,
        schema: &Schema,
        rounds: &[RoundRecord],
    ) -> Result<(Option<Artifact>, PhaseStatus, Vec<ErrorRecord>)> {
        let executor = Executor::with_deadline_ms(self.config.executor_deadline_ms);
        let phase = CodePhase::new(self.model.clone(), executor, self.cancel.clone());
        let outcome = phase.execute(schema, rounds).await?;

        let mut errors = Vec::new();
        if outcome.status != PhaseStatus::Succeeded {
            for iteration in &outcome.iterations {
                for verification in iteration.verifications.iter().filter(|v| !v.passed) {
                    let message = match &verification.error {
                        Some(error) => error.to_string(),
                        None => format!(
                            "{} field(s) below the F1 threshold",
                            verification.diffs.len()
                        ),
                    };
                    errors.push(ErrorRecord::new(
                        "code",
                        Some(verification.exemplar_id.clone()),
                        "verification",
                        format!("iteration {}: {message}", iteration.index),
                    ));
                }
            }
        }
        Ok((outcome.artifact, outcome.status, errors))
    }

    async fn run_batch_stage(
        &self,
        artifact: &Artifact,
        paths: &[PathBuf],
    ) -> Result<(BatchOutcome, Vec<ErrorRecord>)> {
        let (documents, fetch_failures) = self.fetch_documents(paths).await?;

        let runner = BatchRunner::new(
            self.config.effective_batch_workers(),
            ExecutorLimits {
                deadline: std::time::Duration::from_millis(self.config.executor_deadline_ms),
                ..ExecutorLimits::default()
            },
            self.cancel.clone(),
        );
        let mut batch = runner.run(artifact, &documents)?;

        // Documents that never fetched join the outcome as failures so the
        // result covers the whole corpus.
        batch.failed_count += fetch_failures.len();
        batch.outcomes.extend(fetch_failures);
        batch.outcomes.sort_by(|a, b| a.id.cmp(&b.id));

        let errors = batch
            .outcomes
            .iter()
            .filter_map(|outcome| {
                outcome.error.as_ref().map(|message| {
                    ErrorRecord::new("batch", Some(outcome.id.clone()), "executor", message)
                })
            })
            .collect();

        if self.config.should_save("data") {
            self.write_records(&batch)?;
        }

        Ok((batch, errors))
    }

    async fn fetch_documents(
        &self,
        paths: &[PathBuf],
    ) -> Result<(Vec<Document>, Vec<DocumentOutcome>)> {
        let mut documents = Vec::with_capacity(paths.len());
        let mut failures = Vec::new();
        for path in paths {
            self.cancel.checkpoint()?;
            let target = path.to_string_lossy();
            match self.fetcher.fetch(&target).await {
                Ok(fetched) => documents.push(Document {
                    id: fetched.id,
                    original_html: fetched.original_html,
                    simplified_html: fetched.simplified_html,
                }),
                Err(err) => {
                    tracing::warn!(doc = %target, error = %err, "fetch failed");
                    failures.push(DocumentOutcome {
                        id: doc_id(path),
                        record: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        Ok((documents, failures))
    }

    fn corpus_paths(&self, corpus: &Path) -> Result<Vec<PathBuf>> {
        apply_ignores(list_corpus(corpus)?, &self.config.ignores)
    }

    fn schema_store(&self) -> Result<SchemaStore> {
        SchemaStore::new(self.config.run_dir().join("schemas"))
    }

    fn ensure_run_dir(&self) -> Result<PathBuf> {
        let dir = self.config.run_dir();
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        Ok(dir)
    }

    fn write_parser(&self, source: &str) -> Result<PathBuf> {
        let dir = self.ensure_run_dir()?.join("parsers");
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        let path = dir.join(format!("final_parser.{ARTIFACT_EXTENSION}"));
        std::fs::write(&path, source).map_err(|e| PipelineError::io(&path, e))?;
        Ok(path)
    }

    fn write_records(&self, batch: &BatchOutcome) -> Result<()> {
        let dir = self.ensure_run_dir()?.join("result");
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
        for outcome in &batch.outcomes {
            let Some(record) = &outcome.record else {
                continue;
            };
            let path = dir.join(format!("{}.json", outcome.id));
            let rendered = serde_json::to_string_pretty(record)
                .map_err(|e| PipelineError::Internal(format!("failed to render record: {e}")))?;
            std::fs::write(&path, rendered).map_err(|e| PipelineError::io(&path, e))?;
        }
        Ok(())
    }

    fn copy_cluster_files(&self, paths: &[PathBuf], outcome: &ClusterOutcome) -> Result<()> {
        let clusters_dir = self.ensure_run_dir()?.join("clusters");
        for (path, label) in paths.iter().zip(&outcome.labels) {
            let subdir = if *label < 0 {
                clusters_dir.join("noise")
            } else {
                clusters_dir.join(format!("cluster_{label}"))
            };
            std::fs::create_dir_all(&subdir).map_err(|e| PipelineError::io(&subdir, e))?;
            let file_name = path
                .file_name()
                .ok_or_else(|| PipelineError::Internal("corpus path has no file name".into()))?;
            std::fs::copy(path, subdir.join(file_name))
                .map_err(|e| PipelineError::io(path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plan_clamps_rounds_to_corpus_size() {
        let paths: Vec<PathBuf> = (0..2).map(|i| PathBuf::from(format!("/c/{i}.html"))).collect();
        let plan = Plan::new(&paths, 5);
        assert_eq!(plan.iteration_rounds, 2);
        assert_eq!(plan.exemplars.len(), 2);
    }

    #[test]
    fn plan_takes_exemplars_in_corpus_order() {
        let paths: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("/c/{i}.html"))).collect();
        let plan = Plan::new(&paths, 3);
        assert_eq!(plan.exemplars[0], "/c/0.html");
        assert_eq!(plan.exemplars[2], "/c/2.html");
    }
}
