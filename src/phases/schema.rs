//! Schema refinement phase.
//!
//! One round per exemplar: fetch, prompt, merge the model's answer into
//! the accumulated schema, persist. A round that keeps failing after the
//! retry budget fails alone; the phase succeeds when a majority of rounds
//! did. The phase is re-entrant: seeding it with a schema (and predefined
//! mode) is how the edit gate re-runs it after a user adds fields.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::cancel::CancelFlag;
use crate::config::SchemaMode;
use crate::error::Result;
use crate::fetch::HtmlFetcher;
use crate::model::{MODEL_RETRIES, ModelClient, complete_json_with_retry};
use crate::phases::PhaseStatus;
use crate::prompt::Prompter;
use crate::schema::{Schema, SchemaStore};

/// Consecutive no-change rounds required before an early stop.
const EARLY_STOP_STREAK: usize = 2;

/// One completed (or failed) round.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub index: usize,
    pub exemplar_id: String,
    /// Simplified HTML of the exemplar; the code phase verifies against it.
    pub simplified_html: String,
    pub schema_before: Schema,
    pub schema_after: Schema,
    /// The model's raw answer for this exemplar alone. Its value samples
    /// are this document's expected values during code verification.
    pub reported: Schema,
    pub succeeded: bool,
    /// Failure reason for rounds that did not complete.
    pub note: Option<String>,
}

#[derive(Debug)]
pub struct SchemaPhaseOutcome {
    pub status: PhaseStatus,
    /// Present when the phase succeeded.
    pub final_schema: Option<Schema>,
    pub rounds: Vec<RoundRecord>,
    /// Merged schema after each successful round, in round order. On
    /// failure the last entry is the best schema the phase reached.
    pub intermediate_schemas: Vec<Schema>,
    pub stopped_early: bool,
}

impl SchemaPhaseOutcome {
    pub fn succeeded_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| r.succeeded).count()
    }
}

pub struct SchemaPhase {
    fetcher: Arc<dyn HtmlFetcher>,
    model: Arc<dyn ModelClient>,
    prompter: Prompter,
    mode: SchemaMode,
    predefined: IndexMap<String, String>,
    store: Option<SchemaStore>,
    early_stop: bool,
    cancel: CancelFlag,
}

impl SchemaPhase {
    pub fn new(
        fetcher: Arc<dyn HtmlFetcher>,
        model: Arc<dyn ModelClient>,
        prompter: Prompter,
        mode: SchemaMode,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            fetcher,
            model,
            prompter,
            mode,
            predefined: IndexMap::new(),
            store: None,
            early_stop: false,
            cancel,
        }
    }

    /// Fix the field name-set for predefined mode.
    pub fn with_predefined(mut self, predefined: IndexMap<String, String>) -> Self {
        self.predefined = predefined;
        self
    }

    /// Persist per-round and final schemas through a store.
    pub fn with_store(mut self, store: SchemaStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_early_stop(mut self, enabled: bool) -> Self {
        self.early_stop = enabled;
        self
    }

    /// Run the phase over the planned exemplars.
    ///
    /// `seed` overrides the starting schema; without it, auto mode starts
    /// empty and predefined mode starts from the configured name-set.
    pub async fn execute(
        &self,
        exemplars: &[String],
        seed: Option<Schema>,
    ) -> Result<SchemaPhaseOutcome> {
        let mut current = match (&seed, self.mode) {
            (Some(schema), _) => schema.clone(),
            (None, SchemaMode::Predefined) => Schema::from_predefined(&self.predefined),
            (None, SchemaMode::Auto) => Schema::new(),
        };

        let mut rounds: Vec<RoundRecord> = Vec::new();
        let mut intermediates: Vec<Schema> = Vec::new();
        let mut unchanged_streak = 0usize;
        let mut stopped_early = false;

        for (index, target) in exemplars.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(round = index, "schema phase cancelled between rounds");
                return Ok(SchemaPhaseOutcome {
                    status: PhaseStatus::Cancelled,
                    final_schema: None,
                    rounds,
                    intermediate_schemas: intermediates,
                    stopped_early: false,
                });
            }

            tracing::info!(round = index, exemplar = %target, "schema round starting");
            match self.run_round(index, target, &current).await {
                Ok(round) => {
                    let changed = round.schema_after != round.schema_before;
                    current = round.schema_after.clone();
                    intermediates.push(current.clone());
                    if let Some(store) = &self.store {
                        store.save_round(index, &current)?;
                    }
                    rounds.push(round);

                    unchanged_streak = if changed { 0 } else { unchanged_streak + 1 };
                    if self.early_stop
                        && unchanged_streak >= EARLY_STOP_STREAK
                        && index + 1 < exemplars.len()
                    {
                        tracing::info!(
                            round = index,
                            "schema stable for {EARLY_STOP_STREAK} rounds, stopping early"
                        );
                        stopped_early = true;
                        break;
                    }
                }
                Err(crate::PipelineError::Cancelled) => {
                    return Ok(SchemaPhaseOutcome {
                        status: PhaseStatus::Cancelled,
                        final_schema: None,
                        rounds,
                        intermediate_schemas: intermediates,
                        stopped_early: false,
                    });
                }
                Err(err) => {
                    tracing::warn!(round = index, error = %err, "schema round failed");
                    rounds.push(RoundRecord {
                        index,
                        exemplar_id: crate::corpus::doc_id(std::path::Path::new(target)),
                        simplified_html: String::new(),
                        schema_before: current.clone(),
                        schema_after: current.clone(),
                        reported: Schema::new(),
                        succeeded: false,
                        note: Some(err.to_string()),
                    });
                }
            }
        }

        let succeeded = rounds.iter().filter(|r| r.succeeded).count();
        let needed = rounds.len().div_ceil(2);
        if succeeded < needed.max(1) {
            tracing::warn!(succeeded, total = rounds.len(), "schema phase failed");
            return Ok(SchemaPhaseOutcome {
                status: PhaseStatus::Failed,
                final_schema: None,
                rounds,
                intermediate_schemas: intermediates,
                stopped_early,
            });
        }

        current.ensure_locator_slots();
        if let Some(store) = &self.store {
            store.save_final(&current)?;
        }
        tracing::info!(
            fields = current.len(),
            rounds = rounds.len(),
            succeeded,
            "schema phase complete"
        );

        Ok(SchemaPhaseOutcome {
            status: PhaseStatus::Succeeded,
            final_schema: Some(current),
            rounds,
            intermediate_schemas: intermediates,
            stopped_early,
        })
    }

    async fn run_round(
        &self,
        index: usize,
        target: &str,
        current: &Schema,
    ) -> Result<RoundRecord> {
        let document = self.fetcher.fetch(target).await?;

        let prompt = if current.is_empty() && self.mode == SchemaMode::Auto {
            self.prompter.discovery_prompt(&document.simplified_html)
        } else {
            self.prompter
                .refinement_prompt(current, &document.simplified_html)?
        };

        let value = complete_json_with_retry(
            self.model.as_ref(),
            self.prompter.system_message(),
            &prompt,
            MODEL_RETRIES,
            &self.cancel,
        )
        .await?;
        let reported = Schema::from_json_value(&value)?;

        let schema_before = current.clone();
        let mut schema_after = current.clone();
        match self.mode {
            SchemaMode::Auto => schema_after.merge_auto(&reported),
            SchemaMode::Predefined => {
                let discarded = schema_after.merge_predefined(&reported);
                if discarded > 0 {
                    tracing::debug!(
                        round = index,
                        discarded,
                        "model proposed fields outside the predefined set"
                    );
                }
            }
        }
        if schema_after.is_empty() {
            return Err(crate::PipelineError::SchemaMerge(
                "round produced no usable fields".to_string(),
            ));
        }

        Ok(RoundRecord {
            index,
            exemplar_id: document.id,
            simplified_html: document.simplified_html,
            schema_before,
            schema_after,
            reported,
            succeeded: true,
            note: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::PipelineError;
    use crate::fetch::FetchedDocument;
    use crate::prompt::PromptVersion;

    /// Fetcher that serves canned documents keyed by target.
    struct MapFetcher;

    #[async_trait]
    impl HtmlFetcher for MapFetcher {
        async fn fetch(&self, target: &str) -> Result<FetchedDocument> {
            Ok(FetchedDocument {
                id: target.to_string(),
                original_html: format!("<html><body>{target}</body></html>"),
                simplified_html: format!("<body>{target}</body>"),
            })
        }
    }

    /// Model that replies with a scripted schema per call.
    struct ScriptedModel {
        replies: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _: &str, _: &str, _: bool) -> Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(PipelineError::Model("script exhausted".into())))
        }
    }

    fn field_reply(fields: &[(&str, &str)]) -> Result<String> {
        let mut obj = serde_json::Map::new();
        for (name, sample) in fields {
            obj.insert(
                name.to_string(),
                serde_json::json!({
                    "type": "string",
                    "description": format!("the {name}"),
                    "value_samples": [sample],
                    "locators": [format!(".{name}")]
                }),
            );
        }
        Ok(serde_json::Value::Object(obj).to_string())
    }

    fn phase(model: ScriptedModel, mode: SchemaMode) -> SchemaPhase {
        let version = match mode {
            SchemaMode::Auto => PromptVersion::V1,
            SchemaMode::Predefined => PromptVersion::V2,
        };
        SchemaPhase::new(
            Arc::new(MapFetcher),
            Arc::new(model),
            Prompter::new(version),
            mode,
            CancelFlag::new(),
        )
    }

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc{i}")).collect()
    }

    #[tokio::test]
    async fn auto_mode_unions_field_names_across_rounds() {
        let model = ScriptedModel::new(vec![
            field_reply(&[("title", "A"), ("price", "$1")]),
            field_reply(&[("title", "B"), ("author", "X")]),
            field_reply(&[("title", "C"), ("price", "$2"), ("isbn", "123")]),
        ]);
        let outcome = phase(model, SchemaMode::Auto)
            .execute(&targets(3), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseStatus::Succeeded);
        let schema = outcome.final_schema.unwrap();
        let names: Vec<_> = schema.field_names().cloned().collect();
        assert_eq!(names, vec!["title", "price", "author", "isbn"]);
        assert_eq!(
            schema.get("title").unwrap().value_samples,
            vec!["A", "B", "C"]
        );
        assert_eq!(outcome.rounds.len(), 3);
        assert_eq!(outcome.intermediate_schemas.len(), 3);
    }

    #[tokio::test]
    async fn exemplar_order_does_not_change_the_name_set() {
        let replies = [
            [("title", "A"), ("price", "$1")],
            [("title", "B"), ("author", "X")],
        ];
        let forward = ScriptedModel::new(vec![
            field_reply(&replies[0]),
            field_reply(&replies[1]),
        ]);
        let reversed = ScriptedModel::new(vec![
            field_reply(&replies[1]),
            field_reply(&replies[0]),
        ]);

        let a = phase(forward, SchemaMode::Auto)
            .execute(&targets(2), None)
            .await
            .unwrap();
        let b = phase(reversed, SchemaMode::Auto)
            .execute(&targets(2), None)
            .await
            .unwrap();

        let mut names_a: Vec<_> = a.final_schema.unwrap().field_names().cloned().collect();
        let mut names_b: Vec<_> = b.final_schema.unwrap().field_names().cloned().collect();
        names_a.sort();
        names_b.sort();
        assert_eq!(names_a, names_b);
    }

    #[tokio::test]
    async fn predefined_mode_keeps_the_name_set_frozen() {
        let model = ScriptedModel::new(vec![
            field_reply(&[("title", "A"), ("sneaky", "nope")]),
            field_reply(&[("title", "B")]),
        ]);
        let mut predefined = IndexMap::new();
        predefined.insert("title".to_string(), "string".to_string());
        predefined.insert("price".to_string(), "float".to_string());

        let outcome = phase(model, SchemaMode::Predefined)
            .with_predefined(predefined)
            .execute(&targets(2), None)
            .await
            .unwrap();

        let schema = outcome.final_schema.unwrap();
        let names: Vec<_> = schema.field_names().cloned().collect();
        assert_eq!(names, vec!["title", "price"]);
        // The missing field keeps its seeded locator slot.
        assert_eq!(schema.get("price").unwrap().locators, vec![""]);
    }

    #[tokio::test]
    async fn a_failing_round_does_not_fail_the_phase() {
        let model = ScriptedModel::new(vec![
            field_reply(&[("title", "A")]),
            // Three attempts of garbage exhaust the round's retry budget.
            Ok("garbage".into()),
            Ok("garbage".into()),
            Ok("garbage".into()),
            field_reply(&[("title", "C")]),
        ]);
        let outcome = phase(model, SchemaMode::Auto)
            .execute(&targets(3), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseStatus::Succeeded);
        assert_eq!(outcome.succeeded_rounds(), 2);
        assert!(!outcome.rounds[1].succeeded);
        assert!(outcome.rounds[1].note.is_some());
    }

    #[tokio::test]
    async fn majority_failure_fails_the_phase_but_keeps_partial_schemas() {
        let garbage = || Ok::<String, PipelineError>("garbage".into());
        let model = ScriptedModel::new(vec![
            field_reply(&[("title", "A")]),
            garbage(),
            garbage(),
            garbage(),
            garbage(),
            garbage(),
            garbage(),
        ]);
        let outcome = phase(model, SchemaMode::Auto)
            .execute(&targets(3), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseStatus::Failed);
        assert!(outcome.final_schema.is_none());
        assert_eq!(outcome.intermediate_schemas.len(), 1);
        assert!(outcome.intermediate_schemas[0].get("title").is_some());
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_rounds() {
        struct CancellingModel {
            cancel: CancelFlag,
            calls: Mutex<usize>,
        }

        #[async_trait]
        impl ModelClient for CancellingModel {
            fn name(&self) -> &str {
                "cancelling"
            }

            async fn complete(&self, _: &str, _: &str, _: bool) -> Result<String> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 2 {
                    self.cancel.cancel();
                }
                field_reply(&[("title", "A")])
            }
        }

        let cancel = CancelFlag::new();
        let model = CancellingModel {
            cancel: cancel.clone(),
            calls: Mutex::new(0),
        };
        let phase = SchemaPhase::new(
            Arc::new(MapFetcher),
            Arc::new(model),
            Prompter::new(PromptVersion::V1),
            SchemaMode::Auto,
            cancel,
        );

        let outcome = phase.execute(&targets(4), None).await.unwrap();
        assert_eq!(outcome.status, PhaseStatus::Cancelled);
        assert_eq!(outcome.rounds.len(), 2);
        assert!(outcome.final_schema.is_none());
    }

    #[tokio::test]
    async fn early_stop_when_schema_settles() {
        let model = ScriptedModel::new(vec![
            field_reply(&[("title", "A")]),
            field_reply(&[("title", "A")]),
            field_reply(&[("title", "A")]),
            field_reply(&[("title", "A")]),
        ]);
        let outcome = phase(model, SchemaMode::Auto)
            .with_early_stop(true)
            .execute(&targets(4), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseStatus::Succeeded);
        assert!(outcome.stopped_early);
        assert_eq!(outcome.rounds.len(), 3);
    }

    #[tokio::test]
    async fn persists_rounds_and_final_schema() {
        let dir = tempfile::tempdir().unwrap();
        let model = ScriptedModel::new(vec![
            field_reply(&[("title", "A")]),
            field_reply(&[("title", "B")]),
        ]);
        let store = SchemaStore::new(dir.path().join("schemas")).unwrap();
        let outcome = phase(model, SchemaMode::Auto)
            .with_store(SchemaStore::new(dir.path().join("schemas")).unwrap())
            .execute(&targets(2), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, PhaseStatus::Succeeded);
        assert_eq!(store.load_intermediates().unwrap().len(), 2);
        assert!(store.final_path().exists());
    }
}
