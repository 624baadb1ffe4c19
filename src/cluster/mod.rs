//! Layout clustering.
//!
//! A mixed corpus (list pages and detail pages in one directory, say) is
//! partitioned into layout-homogeneous groups before learning. Each
//! document is reduced to a structural fingerprint, pairwise similarity is
//! computed in parallel, and a density scan assigns cluster labels.

mod dbscan;
mod fingerprint;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub use dbscan::NOISE;
pub use fingerprint::{fingerprint, jaccard};

/// Tuning knobs for the layout scan.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// Maximum structural distance (1 - similarity) between neighbors.
    pub eps: f64,
    /// Minimum neighborhood size (the point itself included) for a core
    /// point.
    pub min_samples: usize,
    /// When set, the neighbor graph is pruned to the k nearest neighbors
    /// per document before scanning, which keeps dense corpora from
    /// producing one giant neighbor list per node.
    pub knn: Option<usize>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps: 0.3,
            min_samples: 2,
            knn: Some(10),
        }
    }
}

/// Assign a cluster label to every input document.
///
/// Labels are non-negative cluster ids in discovery order; `NOISE` (-1)
/// marks documents that belong to no cluster. Output is deterministic for
/// identical input regardless of thread count.
pub fn cluster_layouts(htmls: &[String], params: &ClusterParams) -> Result<Vec<i32>> {
    if !(params.eps > 0.0 && params.eps <= 1.0) {
        return Err(PipelineError::Cluster(format!(
            "eps must be in (0, 1], got {}",
            params.eps
        )));
    }
    if params.min_samples < 1 {
        return Err(PipelineError::Cluster(
            "minSamples must be at least 1".to_string(),
        ));
    }
    if htmls.is_empty() {
        return Ok(Vec::new());
    }

    let fingerprints: Vec<_> = htmls.par_iter().map(|html| fingerprint(html)).collect();

    // Pairwise similarity, parallel by row. Row results land at fixed
    // indices, so the matrix is identical for any worker count.
    let n = fingerprints.len();
    let distances: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| 1.0 - jaccard(&fingerprints[i], &fingerprints[j]))
                .collect()
        })
        .collect();

    let neighbors = dbscan::neighbor_graph(&distances, params.eps, params.knn);
    Ok(dbscan::scan(&neighbors, params.min_samples))
}

/// Cluster labels grouped into a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOutcome {
    /// `cluster_<label>` to member document ids, labels ascending.
    pub clusters: IndexMap<String, Vec<String>>,
    /// Label per input, aligned with the input order.
    pub labels: Vec<i32>,
    /// Documents assigned to no cluster, listed last.
    pub noise: Vec<String>,
    pub cluster_count: usize,
}

impl ClusterOutcome {
    pub fn from_labels(ids: &[String], labels: Vec<i32>) -> Self {
        let mut clusters: IndexMap<String, Vec<String>> = IndexMap::new();
        let mut noise = Vec::new();

        let mut sorted_labels: Vec<i32> = labels
            .iter()
            .copied()
            .filter(|label| *label != NOISE)
            .collect();
        sorted_labels.sort_unstable();
        sorted_labels.dedup();

        for &label in &sorted_labels {
            let members: Vec<String> = ids
                .iter()
                .zip(&labels)
                .filter(|(_, l)| **l == label)
                .map(|(id, _)| id.clone())
                .collect();
            clusters.insert(format!("cluster_{label}"), members);
        }
        for (id, label) in ids.iter().zip(&labels) {
            if *label == NOISE {
                noise.push(id.clone());
            }
        }

        Self {
            cluster_count: sorted_labels.len(),
            clusters,
            labels,
            noise,
        }
    }

    pub fn summary(&self) -> String {
        let clustered: usize = self.clusters.values().map(|m| m.len()).sum();
        format!(
            "{} layout cluster(s) over {} document(s), {} noise",
            self.cluster_count,
            clustered + self.noise.len(),
            self.noise.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn list_page(n: usize) -> String {
        let items: String = (0..n)
            .map(|i| format!("<li><a href=\"/{i}\">item {i}</a><span>tag</span></li>"))
            .collect();
        format!("<html><body><div class=\"listing\"><ul>{items}</ul></div></body></html>")
    }

    fn detail_page(title: &str) -> String {
        format!(
            "<html><body><article><h1>{title}</h1><table><tr><td>price</td><td>$1</td></tr>\
             <tr><td>isbn</td><td>123</td></tr></table><p>description text</p></article></body></html>"
        )
    }

    #[test]
    fn separates_two_layout_families() {
        let htmls = vec![
            list_page(8),
            detail_page("Dune"),
            list_page(9),
            detail_page("Foundation"),
            list_page(10),
        ];
        let labels = cluster_layouts(&htmls, &ClusterParams::default()).unwrap();

        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[0], labels[4]);
        assert_eq!(labels[1], labels[3]);
        assert_ne!(labels[0], labels[1]);
        // First discovered family gets the lower label.
        assert_eq!(labels[0], 0);
    }

    #[test]
    fn lone_layout_is_noise() {
        let htmls = vec![
            list_page(8),
            list_page(9),
            "<html><body><form><input/><input/></form></body></html>".to_string(),
        ];
        let labels = cluster_layouts(&htmls, &ClusterParams::default()).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], NOISE);
    }

    #[test]
    fn deterministic_across_runs() {
        let htmls: Vec<String> = (0..12)
            .map(|i| if i % 2 == 0 { list_page(6 + i) } else { detail_page("t") })
            .collect();
        let params = ClusterParams::default();
        let first = cluster_layouts(&htmls, &params).unwrap();
        for _ in 0..3 {
            assert_eq!(cluster_layouts(&htmls, &params).unwrap(), first);
        }
    }

    #[test]
    fn empty_input_yields_no_labels() {
        assert!(cluster_layouts(&[], &ClusterParams::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn invalid_eps_is_a_cluster_error() {
        let result = cluster_layouts(
            &[list_page(3)],
            &ClusterParams {
                eps: 0.0,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(PipelineError::Cluster(_))));
    }

    #[test]
    fn outcome_groups_ids_by_label() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let outcome = ClusterOutcome::from_labels(&ids, vec![0, NOISE, 0, 1]);
        assert_eq!(outcome.cluster_count, 2);
        assert_eq!(outcome.clusters["cluster_0"], vec!["a", "c"]);
        assert_eq!(outcome.clusters["cluster_1"], vec!["d"]);
        assert_eq!(outcome.noise, vec!["b"]);
    }
}
