//! Code generation phase.
//!
//! The model writes an extraction program for the learned schema, the
//! executor runs it against every exemplar, and the evaluator scores the
//! output against the values the schema phase recorded for that exemplar.
//! Failures feed a repair prompt; the loop ends with the best program that
//! passed verification, or surfaces the best attempt when none did.

use std::sync::Arc;

use crate::artifact::Artifact;
use crate::cancel::CancelFlag;
use crate::error::{PipelineError, Result};
use crate::eval::{self, FieldMetrics};
use crate::executor::{Executor, ExtractError};
use crate::model::{MODEL_RETRIES, ModelClient, complete_json_with_retry};
use crate::phases::schema::RoundRecord;
use crate::phases::PhaseStatus;
use crate::prompt::CodePrompter;
use crate::schema::Schema;

/// Minimum per-field F1 for a field to count as passing.
pub const VERIFY_F1_THRESHOLD: f64 = 0.8;
/// Fraction of fields (rounded up) that must pass per exemplar.
pub const VERIFY_FIELD_FRACTION: f64 = 0.7;
/// Repair attempts after the initial generation.
pub const MAX_REPAIRS: usize = 3;

/// Exemplar HTML beyond this many characters is truncated in prompts.
const MAX_PROMPT_HTML: usize = 30_000;
/// Expected/actual values in repair prompts are clipped to this length.
const MAX_DIFF_VALUE: usize = 120;

/// Verification of one artifact against one exemplar.
#[derive(Debug, Clone)]
pub struct ExemplarVerification {
    pub exemplar_id: String,
    pub passed: bool,
    /// Per-field scores, in schema order.
    pub field_metrics: Vec<(String, FieldMetrics)>,
    /// Fields scoring below the threshold, with expected/actual values.
    pub diffs: Vec<FieldDiff>,
    /// Execution fault, if the artifact threw instead of returning.
    pub error: Option<ExtractError>,
}

#[derive(Debug, Clone)]
pub struct FieldDiff {
    pub field: String,
    pub expected: Vec<String>,
    pub actual: String,
    pub f1: f64,
}

/// One generate-or-repair cycle.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub index: usize,
    pub passed: bool,
    pub aggregate_f1: f64,
    pub verifications: Vec<ExemplarVerification>,
}

#[derive(Debug)]
pub struct CodePhaseOutcome {
    pub status: PhaseStatus,
    /// The selected program: the passing iteration with the highest
    /// aggregate F1 (earliest on ties), or the best attempt on failure.
    pub artifact: Option<Artifact>,
    pub iterations: Vec<IterationReport>,
    /// Index into `iterations` of the selected program.
    pub selected: Option<usize>,
}

pub struct CodePhase {
    model: Arc<dyn ModelClient>,
    prompter: CodePrompter,
    executor: Executor,
    max_repairs: usize,
    cancel: CancelFlag,
}

impl CodePhase {
    pub fn new(model: Arc<dyn ModelClient>, executor: Executor, cancel: CancelFlag) -> Self {
        Self {
            model,
            prompter: CodePrompter,
            executor,
            max_repairs: MAX_REPAIRS,
            cancel,
        }
    }

    pub fn with_max_repairs(mut self, max_repairs: usize) -> Self {
        self.max_repairs = max_repairs;
        self
    }

    /// Run generate/verify/repair against the schema phase's rounds.
    pub async fn execute(
        &self,
        final_schema: &Schema,
        rounds: &[RoundRecord],
    ) -> Result<CodePhaseOutcome> {
        let exemplars: Vec<&RoundRecord> = rounds
            .iter()
            .filter(|r| r.succeeded && !r.simplified_html.is_empty())
            .collect();
        if exemplars.is_empty() {
            return Err(PipelineError::CodeGeneration(
                "no successful schema rounds to verify against".to_string(),
            ));
        }

        let mut iterations: Vec<IterationReport> = Vec::new();
        let mut artifacts: Vec<Artifact> = Vec::new();

        for iteration in 0..=self.max_repairs {
            if self.cancel.is_cancelled() {
                return Ok(self.conclude(PhaseStatus::Cancelled, iterations, artifacts));
            }

            let artifact = if iteration == 0 {
                tracing::info!("generating extraction program");
                self.generate(final_schema, exemplars[0]).await
            } else {
                let previous = artifacts
                    .last()
                    .expect("repair always follows an earlier artifact");
                let report = failure_report(iterations.last());
                tracing::info!(iteration, "repairing extraction program");
                self.repair(previous, &report, &iterations, &exemplars).await
            };

            let artifact = match artifact {
                Ok(artifact) => artifact,
                Err(PipelineError::Cancelled) => {
                    return Ok(self.conclude(PhaseStatus::Cancelled, iterations, artifacts));
                }
                Err(err) => {
                    tracing::warn!(iteration, error = %err, "program synthesis failed");
                    if iterations.is_empty() {
                        // Nothing to repair from; the phase cannot proceed.
                        return Err(PipelineError::CodeGeneration(err.to_string()));
                    }
                    break;
                }
            };

            let verifications: Vec<ExemplarVerification> = exemplars
                .iter()
                .map(|round| self.verify(&artifact, final_schema, round))
                .collect();
            let passed = verifications.iter().all(|v| v.passed);
            let aggregate_f1 = aggregate_f1(&verifications);
            tracing::info!(iteration, passed, aggregate_f1, "verification complete");

            iterations.push(IterationReport {
                index: iteration,
                passed,
                aggregate_f1,
                verifications,
            });
            artifacts.push(artifact);

            if passed {
                break;
            }
        }

        let any_passed = iterations.iter().any(|i| i.passed);
        let status = if any_passed {
            PhaseStatus::Succeeded
        } else {
            PhaseStatus::Failed
        };
        Ok(self.conclude(status, iterations, artifacts))
    }

    fn conclude(
        &self,
        status: PhaseStatus,
        iterations: Vec<IterationReport>,
        artifacts: Vec<Artifact>,
    ) -> CodePhaseOutcome {
        let selected = select_iteration(&iterations);
        let artifact = selected.and_then(|i| artifacts.get(i).cloned());
        CodePhaseOutcome {
            status,
            artifact,
            iterations,
            selected,
        }
    }

    async fn generate(&self, schema: &Schema, exemplar: &RoundRecord) -> Result<Artifact> {
        let prompt = self
            .prompter
            .generate_prompt(schema, &clip(&exemplar.simplified_html, MAX_PROMPT_HTML))?;
        self.complete_program(&prompt).await
    }

    async fn repair(
        &self,
        previous: &Artifact,
        report: &str,
        iterations: &[IterationReport],
        exemplars: &[&RoundRecord],
    ) -> Result<Artifact> {
        // Show the model the first exemplar it is currently failing on.
        let failing_html = iterations
            .last()
            .and_then(|it| it.verifications.iter().find(|v| !v.passed))
            .and_then(|v| {
                exemplars
                    .iter()
                    .find(|r| r.exemplar_id == v.exemplar_id)
                    .map(|r| clip(&r.simplified_html, MAX_PROMPT_HTML))
            })
            .unwrap_or_default();

        let report = if failing_html.is_empty() {
            report.to_string()
        } else {
            format!("{report}\n\nFailing document:\n\n```html\n{failing_html}\n```")
        };
        let prompt = self.prompter.repair_prompt(previous.source(), &report);
        self.complete_program(&prompt).await
    }

    /// Ask the model for a program, retrying shape failures within the
    /// same attempt budget as transport failures.
    async fn complete_program(&self, prompt: &str) -> Result<Artifact> {
        let mut last_err = None;
        for _attempt in 0..MODEL_RETRIES {
            self.cancel.checkpoint()?;
            let outcome = complete_json_with_retry(
                self.model.as_ref(),
                self.prompter.system_message(),
                prompt,
                1,
                &self.cancel,
            )
            .await
            .and_then(Artifact::from_json_value);
            match outcome {
                Ok(artifact) => return Ok(artifact),
                Err(err) if err.is_retryable() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| PipelineError::CodeGeneration("no attempts were made".into())))
    }

    /// Run the program on one exemplar and score each field against the
    /// values the schema phase reported for that document.
    fn verify(
        &self,
        artifact: &Artifact,
        schema: &Schema,
        round: &RoundRecord,
    ) -> ExemplarVerification {
        let record = match self.executor.run(artifact, &round.simplified_html) {
            Ok(record) => record,
            Err(error) => {
                return ExemplarVerification {
                    exemplar_id: round.exemplar_id.clone(),
                    passed: false,
                    field_metrics: Vec::new(),
                    diffs: Vec::new(),
                    error: Some(error),
                };
            }
        };

        let mut field_metrics = Vec::new();
        let mut diffs = Vec::new();
        for (field, _) in schema.iter() {
            let expected = round
                .reported
                .get(field)
                .map(|spec| spec.value_samples.clone())
                .unwrap_or_default();
            let actual = record.get(field).cloned().unwrap_or_default();
            let extracted = eval::values_for_eval(&actual);

            let metrics = eval::compute_field_metrics(&extracted, &expected);
            if metrics.f1 < VERIFY_F1_THRESHOLD {
                diffs.push(FieldDiff {
                    field: field.clone(),
                    expected,
                    actual,
                    f1: metrics.f1,
                });
            }
            field_metrics.push((field.clone(), metrics));
        }

        let required = required_passing(schema.len());
        let passing = field_metrics
            .iter()
            .filter(|(_, m)| m.f1 >= VERIFY_F1_THRESHOLD)
            .count();

        ExemplarVerification {
            exemplar_id: round.exemplar_id.clone(),
            passed: passing >= required,
            field_metrics,
            diffs,
            error: None,
        }
    }
}

/// Fields that must clear the F1 threshold for an exemplar to pass.
fn required_passing(field_count: usize) -> usize {
    ((field_count as f64) * VERIFY_FIELD_FRACTION).ceil() as usize
}

/// Micro-averaged F1 over every field of every exemplar.
fn aggregate_f1(verifications: &[ExemplarVerification]) -> f64 {
    let all: Vec<FieldMetrics> = verifications
        .iter()
        .flat_map(|v| v.field_metrics.iter().map(|(_, m)| m.clone()))
        .collect();
    eval::aggregate(&all).f1
}

/// Pick the iteration whose artifact becomes final: passing iterations
/// first (highest aggregate F1, earliest on ties), otherwise the best
/// attempt overall for diagnostics.
fn select_iteration(iterations: &[IterationReport]) -> Option<usize> {
    let better = |best: &IterationReport, candidate: &IterationReport| {
        candidate.aggregate_f1 > best.aggregate_f1 + f64::EPSILON
    };

    let mut selected: Option<usize> = None;
    let passing = iterations.iter().any(|i| i.passed);
    for (index, iteration) in iterations.iter().enumerate() {
        if passing && !iteration.passed {
            continue;
        }
        match selected {
            None => selected = Some(index),
            Some(best) if better(&iterations[best], iteration) => selected = Some(index),
            Some(_) => {}
        }
    }
    selected
}

/// Human-readable summary of the latest iteration's failures, embedded in
/// the repair prompt.
fn failure_report(latest: Option<&IterationReport>) -> String {
    let Some(latest) = latest else {
        return String::new();
    };

    let mut lines = Vec::new();
    for verification in latest.verifications.iter().filter(|v| !v.passed) {
        lines.push(format!("- document '{}':", verification.exemplar_id));
        if let Some(error) = &verification.error {
            lines.push(format!("  execution error: {error}"));
            continue;
        }
        for diff in &verification.diffs {
            lines.push(format!(
                "  field '{}': expected {:?}, got {:?} (F1 {:.2})",
                diff.field,
                diff.expected
                    .iter()
                    .map(|v| clip(v, MAX_DIFF_VALUE))
                    .collect::<Vec<_>>(),
                clip(&diff.actual, MAX_DIFF_VALUE),
                diff.f1
            ));
        }
    }
    lines.join("\n")
}

fn clip(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::executor::ExecutorLimits;
    use crate::schema::{FieldSpec, Schema};

    const GOOD_PROGRAM: &str = r#"{"fields": {
        "title": {"steps": [{"op": "select", "selector": "h1"}, {"op": "text"}]},
        "price": {"steps": [{"op": "select", "selector": ".price"}, {"op": "text"}]}
    }}"#;

    const BAD_PROGRAM: &str = r#"{"fields": {
        "title": {"steps": [{"op": "select", "selector": ".missing"}, {"op": "text"}]},
        "price": {"steps": [{"op": "select", "selector": ".absent"}, {"op": "text"}]}
    }}"#;

    struct ScriptedModel {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _: &str, _: &str, _: bool) -> crate::Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PipelineError::Model("script exhausted".into()))
        }
    }

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.0.insert("title".into(), FieldSpec::default());
        schema.0.insert("price".into(), FieldSpec::default());
        schema
    }

    fn round(id: &str, title: &str, price: &str) -> RoundRecord {
        let mut reported = Schema::new();
        reported.0.insert(
            "title".into(),
            FieldSpec {
                value_samples: vec![title.to_string()],
                ..FieldSpec::default()
            },
        );
        reported.0.insert(
            "price".into(),
            FieldSpec {
                value_samples: vec![price.to_string()],
                ..FieldSpec::default()
            },
        );
        RoundRecord {
            index: 0,
            exemplar_id: id.to_string(),
            simplified_html: format!(
                "<html><body><h1>{title}</h1><div class=\"price\">{price}</div></body></html>"
            ),
            schema_before: Schema::new(),
            schema_after: schema(),
            reported,
            succeeded: true,
            note: None,
        }
    }

    fn code_phase(model: ScriptedModel) -> CodePhase {
        CodePhase::new(
            Arc::new(model),
            Executor::new(ExecutorLimits::default()),
            CancelFlag::new(),
        )
    }

    #[tokio::test]
    async fn a_correct_program_passes_first_try() {
        let phase = code_phase(ScriptedModel::new(&[GOOD_PROGRAM]));
        let rounds = vec![round("a", "Dune", "$9.99"), round("b", "Foundation", "$7.50")];

        let outcome = phase.execute(&schema(), &rounds).await.unwrap();
        assert_eq!(outcome.status, PhaseStatus::Succeeded);
        assert_eq!(outcome.iterations.len(), 1);
        assert!(outcome.iterations[0].passed);
        assert!(outcome.artifact.is_some());
        assert!((outcome.iterations[0].aggregate_f1 - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn a_broken_program_is_repaired() {
        let phase = code_phase(ScriptedModel::new(&[BAD_PROGRAM, GOOD_PROGRAM]));
        let rounds = vec![round("a", "Dune", "$9.99")];

        let outcome = phase.execute(&schema(), &rounds).await.unwrap();
        assert_eq!(outcome.status, PhaseStatus::Succeeded);
        assert_eq!(outcome.iterations.len(), 2);
        assert!(!outcome.iterations[0].passed);
        assert!(outcome.iterations[1].passed);
        assert_eq!(outcome.selected, Some(1));
    }

    #[tokio::test]
    async fn repair_budget_exhaustion_surfaces_the_best_attempt() {
        let phase = code_phase(ScriptedModel::new(&[
            BAD_PROGRAM,
            BAD_PROGRAM,
            BAD_PROGRAM,
            BAD_PROGRAM,
        ]));
        let rounds = vec![round("a", "Dune", "$9.99")];

        let outcome = phase.execute(&schema(), &rounds).await.unwrap();
        assert_eq!(outcome.status, PhaseStatus::Failed);
        assert_eq!(outcome.iterations.len(), 1 + MAX_REPAIRS);
        assert!(outcome.artifact.is_some());
        assert!(outcome.iterations.iter().all(|i| !i.passed));
    }

    #[tokio::test]
    async fn unparseable_programs_exhaust_generation_retries() {
        let phase = code_phase(ScriptedModel::new(&["nope", "still nope", "nope again"]));
        let rounds = vec![round("a", "Dune", "$9.99")];

        let err = phase.execute(&schema(), &rounds).await.unwrap_err();
        assert!(matches!(err, PipelineError::CodeGeneration(_)));
    }

    #[tokio::test]
    async fn no_successful_rounds_is_an_error() {
        let phase = code_phase(ScriptedModel::new(&[GOOD_PROGRAM]));
        let mut bad_round = round("a", "Dune", "$9.99");
        bad_round.succeeded = false;

        let err = phase.execute(&schema(), &[bad_round]).await.unwrap_err();
        assert!(matches!(err, PipelineError::CodeGeneration(_)));
    }

    #[test]
    fn required_passing_rounds_up() {
        assert_eq!(required_passing(2), 2);
        assert_eq!(required_passing(3), 3);
        assert_eq!(required_passing(10), 7);
    }

    #[test]
    fn selection_prefers_passing_then_f1_then_earliest() {
        let iteration = |index, passed, f1| IterationReport {
            index,
            passed,
            aggregate_f1: f1,
            verifications: Vec::new(),
        };

        // Highest-F1 passing iteration wins over a better-scoring failure.
        let iterations = vec![
            iteration(0, false, 0.9),
            iteration(1, true, 0.7),
            iteration(2, true, 0.85),
        ];
        assert_eq!(select_iteration(&iterations), Some(2));

        // Ties go to the earliest iteration.
        let iterations = vec![iteration(0, true, 0.8), iteration(1, true, 0.8)];
        assert_eq!(select_iteration(&iterations), Some(0));

        // With no passing iteration, the best attempt is surfaced.
        let iterations = vec![iteration(0, false, 0.2), iteration(1, false, 0.6)];
        assert_eq!(select_iteration(&iterations), Some(1));

        assert_eq!(select_iteration(&[]), None);
    }
}
