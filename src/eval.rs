//! Extraction quality scoring.
//!
//! Each field of each document is scored independently: every ground-truth
//! value that at least one extracted value matches is a true positive, and
//! every extracted value that matches nothing is a false positive. Matching
//! uses [`crate::normalize::value_match`], so empty-equivalence and
//! substring tolerance apply.

use serde::{Deserialize, Serialize};

use crate::normalize::{is_empty_value, value_match};

const EPSILON: f64 = 1e-12;

/// Per-field precision/recall/F1 with the raw counts behind them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub extracted_count: usize,
    pub groundtruth_count: usize,
}

impl FieldMetrics {
    /// The report for a field where neither side carries any value: a
    /// perfect score with zero counts, so aggregation is not inflated.
    fn all_empty() -> Self {
        Self {
            precision: 1.0,
            recall: 1.0,
            f1: 1.0,
            true_positives: 0,
            false_positives: 0,
            false_negatives: 0,
            extracted_count: 0,
            groundtruth_count: 0,
        }
    }
}

/// Micro-averaged metrics over a set of per-field reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub total_true_positives: usize,
    pub total_false_positives: usize,
    pub total_false_negatives: usize,
    pub total_extracted: usize,
    pub total_groundtruth: usize,
    pub field_count: usize,
}

/// Score one field's extracted values against its ground truth.
pub fn compute_field_metrics(extracted: &[String], groundtruth: &[String]) -> FieldMetrics {
    let extracted_all_empty = extracted.iter().all(|v| is_empty_value(v));
    let groundtruth_all_empty = groundtruth.iter().all(|v| is_empty_value(v));

    if extracted_all_empty && groundtruth_all_empty {
        return FieldMetrics::all_empty();
    }

    // Greedy bipartite matching: any hit marks both sides as matched.
    let mut matched_truth = vec![false; groundtruth.len()];
    let mut matched_extracted = vec![false; extracted.len()];

    for (i, truth) in groundtruth.iter().enumerate() {
        for (j, value) in extracted.iter().enumerate() {
            if value_match(value, truth) {
                matched_truth[i] = true;
                matched_extracted[j] = true;
            }
        }
    }

    let tp = matched_truth.iter().filter(|m| **m).count();
    let fn_count = groundtruth.len() - tp;
    let fp = extracted.len() - matched_extracted.iter().filter(|m| **m).count();

    let precision = (tp as f64 + EPSILON) / ((tp + fp) as f64 + EPSILON);
    let recall = (tp as f64 + EPSILON) / ((tp + fn_count) as f64 + EPSILON);
    let f1 = (2.0 * precision * recall) / (precision + recall + EPSILON);

    FieldMetrics {
        precision,
        recall,
        f1,
        true_positives: tp,
        false_positives: fp,
        false_negatives: fn_count,
        extracted_count: extracted.len(),
        groundtruth_count: groundtruth.len(),
    }
}

/// Micro-average a list of field reports by summing their counts.
///
/// All-empty fields contribute zero counts, so they are effectively
/// excluded here even though they report a perfect score individually.
pub fn aggregate(metrics: &[FieldMetrics]) -> AggregateMetrics {
    let total_tp: usize = metrics.iter().map(|m| m.true_positives).sum();
    let total_fp: usize = metrics.iter().map(|m| m.false_positives).sum();
    let total_fn: usize = metrics.iter().map(|m| m.false_negatives).sum();
    let total_extracted: usize = metrics.iter().map(|m| m.extracted_count).sum();
    let total_groundtruth: usize = metrics.iter().map(|m| m.groundtruth_count).sum();

    let precision = if total_extracted > 0 {
        total_tp as f64 / total_extracted as f64
    } else {
        0.0
    };
    let recall = if total_groundtruth > 0 {
        total_tp as f64 / total_groundtruth as f64
    } else {
        0.0
    };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    AggregateMetrics {
        precision,
        recall,
        f1,
        total_true_positives: total_tp,
        total_false_positives: total_fp,
        total_false_negatives: total_fn,
        total_extracted,
        total_groundtruth,
        field_count: metrics.len(),
    }
}

/// Expand a raw record value into the list of values to score.
///
/// Array-typed fields are carried through records as JSON-encoded strings;
/// everything else is a single value.
pub fn values_for_eval(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            return items
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect();
        }
    }
    vec![raw.to_string()]
}
