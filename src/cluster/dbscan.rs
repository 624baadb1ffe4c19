//! Density-based clustering over a precomputed distance matrix.
//!
//! A trimmed-down DBSCAN: points are visited in index order, core points
//! seed clusters, and clusters expand breadth-first through core
//! neighbors. Visiting order is fixed, so labels are deterministic and the
//! earliest-discovered cluster always gets the lowest id.

use std::collections::VecDeque;

pub const NOISE: i32 = -1;
const UNVISITED: i32 = -2;

/// Build the neighbor lists for every point.
///
/// A neighbor is any other point within `eps`. With `knn` set, each
/// point's candidate list is first cut to its k nearest (ties broken by
/// lower index), and the relation is symmetrized by union so the graph
/// stays undirected.
pub fn neighbor_graph(distances: &[Vec<f64>], eps: f64, knn: Option<usize>) -> Vec<Vec<usize>> {
    let n = distances.len();

    let within_eps = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| j != i && distances[i][j] <= eps)
            .collect()
    };

    let mut neighbors: Vec<Vec<usize>> = match knn {
        None => (0..n).map(within_eps).collect(),
        Some(k) => {
            let pruned: Vec<Vec<usize>> = (0..n)
                .map(|i| {
                    let mut candidates = within_eps(i);
                    candidates.sort_by(|&a, &b| {
                        distances[i][a]
                            .partial_cmp(&distances[i][b])
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.cmp(&b))
                    });
                    candidates.truncate(k);
                    candidates
                })
                .collect();

            // Union-symmetrize: keep the edge if either endpoint kept it.
            let mut symmetric = vec![Vec::new(); n];
            for (i, list) in pruned.iter().enumerate() {
                for &j in list {
                    if !symmetric[i].contains(&j) {
                        symmetric[i].push(j);
                    }
                    if !symmetric[j].contains(&i) {
                        symmetric[j].push(i);
                    }
                }
            }
            symmetric
        }
    };

    for list in &mut neighbors {
        list.sort_unstable();
    }
    neighbors
}

/// Run the density scan and return a label per point.
pub fn scan(neighbors: &[Vec<usize>], min_samples: usize) -> Vec<i32> {
    let n = neighbors.len();
    let mut labels = vec![UNVISITED; n];
    let mut next_label = 0;

    // Neighborhood size counts the point itself.
    let is_core = |i: usize| neighbors[i].len() + 1 >= min_samples;

    for start in 0..n {
        if labels[start] != UNVISITED {
            continue;
        }
        if !is_core(start) {
            labels[start] = NOISE;
            continue;
        }

        labels[start] = next_label;
        let mut queue: VecDeque<usize> = neighbors[start].iter().copied().collect();

        while let Some(point) = queue.pop_front() {
            if labels[point] == NOISE {
                // Border point: reachable from a core, adopted by the cluster.
                labels[point] = next_label;
            }
            if labels[point] != UNVISITED {
                continue;
            }
            labels[point] = next_label;
            if is_core(point) {
                queue.extend(neighbors[point].iter().copied());
            }
        }

        next_label += 1;
    }

    labels
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Distance matrix with two tight groups and one faraway point.
    fn toy_distances() -> Vec<Vec<f64>> {
        let coords: [f64; 6] = [0.0, 0.05, 0.1, 0.9, 0.95, 0.5];
        coords
            .iter()
            .map(|a| coords.iter().map(|b| (a - b).abs()).collect())
            .collect()
    }

    #[test]
    fn finds_two_clusters_and_noise() {
        let distances = toy_distances();
        let neighbors = neighbor_graph(&distances, 0.1, None);
        let labels = scan(&neighbors, 2);
        assert_eq!(labels, vec![0, 0, 0, 1, 1, NOISE]);
    }

    #[test]
    fn min_samples_one_makes_everything_a_cluster() {
        let distances = toy_distances();
        let neighbors = neighbor_graph(&distances, 0.1, None);
        let labels = scan(&neighbors, 1);
        assert!(labels.iter().all(|&l| l >= 0));
        assert_eq!(labels[5], 2);
    }

    #[test]
    fn knn_pruning_keeps_the_graph_symmetric() {
        let distances = toy_distances();
        let neighbors = neighbor_graph(&distances, 0.2, Some(1));
        for (i, list) in neighbors.iter().enumerate() {
            for &j in list {
                assert!(
                    neighbors[j].contains(&i),
                    "edge {i}->{j} lost its reverse"
                );
            }
        }
    }

    #[test]
    fn labels_are_assigned_in_index_order() {
        // Two clusters; the one containing index 0 must get label 0.
        let distances = toy_distances();
        let neighbors = neighbor_graph(&distances, 0.1, None);
        let labels = scan(&neighbors, 2);
        assert_eq!(labels[0], 0);
        assert!(labels[3] > labels[0]);
    }

    #[test]
    fn empty_input() {
        let labels = scan(&[], 2);
        assert!(labels.is_empty());
    }
}
