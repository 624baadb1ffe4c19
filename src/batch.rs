//! Parallel application of the final artifact to the corpus.
//!
//! Documents fan out over a bounded rayon pool; each worker owns its own
//! executor, so artifacts are never shared mutably. One document failing
//! (or timing out, or panicking the interpreter) marks that document
//! failed and nothing else. Output order is by document id regardless of
//! completion order.

use std::panic::{AssertUnwindSafe, catch_unwind};

use rayon::prelude::*;
use serde::Serialize;

use crate::artifact::Artifact;
use crate::cancel::CancelFlag;
use crate::corpus::Document;
use crate::error::{PipelineError, Result};
use crate::executor::{Executor, ExecutorLimits, Record};
use crate::phases::PhaseStatus;

/// Result for one document: a record or an error entry, never both.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOutcome {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub status: PhaseStatus,
    pub success_count: usize,
    pub failed_count: usize,
    /// One entry per processed document, sorted by document id. Documents
    /// never dispatched before a cancellation are absent.
    pub outcomes: Vec<DocumentOutcome>,
}

impl BatchOutcome {
    pub fn summary(&self) -> String {
        format!(
            "{} document(s) extracted, {} failed",
            self.success_count, self.failed_count
        )
    }
}

pub struct BatchRunner {
    workers: usize,
    limits: ExecutorLimits,
    cancel: CancelFlag,
}

impl BatchRunner {
    pub fn new(workers: usize, limits: ExecutorLimits, cancel: CancelFlag) -> Self {
        Self {
            workers: workers.max(1),
            limits,
            cancel,
        }
    }

    /// Apply the artifact to every document.
    ///
    /// Per-document failures are recorded, not raised; the only errors
    /// this returns are infrastructure-level (the pool itself).
    pub fn run(&self, artifact: &Artifact, documents: &[Document]) -> Result<BatchOutcome> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build worker pool: {e}")))?;

        let cancel = &self.cancel;
        let limits = &self.limits;
        let mut outcomes: Vec<DocumentOutcome> = pool.install(|| {
            documents
                .par_iter()
                .map_init(
                    || Executor::new(limits.clone()),
                    |executor, document| {
                        if cancel.is_cancelled() {
                            return None;
                        }
                        Some(extract_one(executor, artifact, document))
                    },
                )
                .filter_map(|outcome| outcome)
                .collect()
        });

        outcomes.sort_by(|a, b| a.id.cmp(&b.id));
        let success_count = outcomes.iter().filter(|o| o.record.is_some()).count();
        let failed_count = outcomes.len() - success_count;
        let status = if self.cancel.is_cancelled() {
            PhaseStatus::Cancelled
        } else {
            PhaseStatus::Succeeded
        };

        tracing::info!(
            total = documents.len(),
            success = success_count,
            failed = failed_count,
            "batch extraction finished"
        );

        Ok(BatchOutcome {
            status,
            success_count,
            failed_count,
            outcomes,
        })
    }
}

fn extract_one(executor: &Executor, artifact: &Artifact, document: &Document) -> DocumentOutcome {
    let run = catch_unwind(AssertUnwindSafe(|| {
        executor.run(artifact, &document.simplified_html)
    }));

    match run {
        Ok(Ok(record)) => DocumentOutcome {
            id: document.id.clone(),
            record: Some(record),
            error: None,
        },
        Ok(Err(error)) => {
            tracing::warn!(doc = %document.id, error = %error, "document failed");
            DocumentOutcome {
                id: document.id.clone(),
                record: None,
                error: Some(error.to_string()),
            }
        }
        Err(_) => {
            tracing::warn!(doc = %document.id, "artifact panicked on document");
            DocumentOutcome {
                id: document.id.clone(),
                record: None,
                error: Some("artifact execution panicked".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn artifact() -> Artifact {
        Artifact::from_source(
            r#"{"fields": {
                "items": {"steps": [{"op": "select_all", "selector": "li"}, {"op": "text"}]},
                "title": {"steps": [{"op": "select", "selector": "h1"}, {"op": "text"}]}
            }}"#,
        )
        .unwrap()
    }

    fn document(id: &str, items: usize) -> Document {
        let list: String = (0..items).map(|i| format!("<li>item {i}</li>")).collect();
        Document {
            id: id.to_string(),
            original_html: String::new(),
            simplified_html: format!("<html><body><h1>{id}</h1><ul>{list}</ul></body></html>"),
        }
    }

    fn runner(workers: usize, max_matches: usize) -> BatchRunner {
        BatchRunner::new(
            workers,
            ExecutorLimits {
                max_matches,
                ..ExecutorLimits::default()
            },
            CancelFlag::new(),
        )
    }

    #[test]
    fn failures_are_isolated_per_document() {
        // 95 small documents pass the match cap, 5 oversized ones exceed it.
        let mut documents: Vec<Document> = (0..95)
            .map(|i| document(&format!("doc{i:03}"), 2))
            .collect();
        documents.extend((95..100).map(|i| document(&format!("doc{i:03}"), 20)));

        let outcome = runner(4, 8).run(&artifact(), &documents).unwrap();
        assert_eq!(outcome.success_count, 95);
        assert_eq!(outcome.failed_count, 5);
        assert_eq!(outcome.outcomes.len(), 100);
        for failed in outcome.outcomes.iter().filter(|o| o.error.is_some()) {
            assert!(failed.id.as_str() >= "doc095");
        }
    }

    #[test]
    fn output_is_sorted_by_id_for_any_worker_count() {
        let documents: Vec<Document> = (0..40)
            .rev()
            .map(|i| document(&format!("doc{i:02}"), 1))
            .collect();

        for workers in [1, 2, 8] {
            let outcome = runner(workers, 100).run(&artifact(), &documents).unwrap();
            let ids: Vec<_> = outcome.outcomes.iter().map(|o| o.id.clone()).collect();
            let mut sorted = ids.clone();
            sorted.sort();
            assert_eq!(ids, sorted);
        }
    }

    #[test]
    fn records_carry_extracted_values() {
        let outcome = runner(2, 100)
            .run(&artifact(), &[document("only", 2)])
            .unwrap();
        let record = outcome.outcomes[0].record.as_ref().unwrap();
        assert_eq!(record["title"], "only");
        assert_eq!(record["items"], r#"["item 0","item 1"]"#);
    }

    #[test]
    fn cancellation_skips_undispatched_documents() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let runner = BatchRunner::new(2, ExecutorLimits::default(), cancel);

        let documents: Vec<Document> = (0..10).map(|i| document(&format!("d{i}"), 1)).collect();
        let outcome = runner.run(&artifact(), &documents).unwrap();
        assert_eq!(outcome.status, PhaseStatus::Cancelled);
        assert!(outcome.outcomes.is_empty());
    }

    #[test]
    fn empty_corpus_runs_cleanly() {
        let outcome = runner(2, 100).run(&artifact(), &[]).unwrap();
        assert_eq!(outcome.success_count, 0);
        assert_eq!(outcome.failed_count, 0);
    }
}
