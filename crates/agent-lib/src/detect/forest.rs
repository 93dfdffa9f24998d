//! Isolation forest
//!
//! Ensemble of randomized binary trees, each grown on a subsample.
//! Anomalies isolate in few splits, so short average path lengths map to
//! scores near 1. Scores are `2^(-E[h(x)] / c(n))` in `(0, 1]`, higher
//! meaning more anomalous. Seeded RNG keeps training reproducible.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Euler-Mascheroni constant for the harmonic-number approximation.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Grow a tree over `rows` (indices into `data`) up to `depth_limit`.
    fn grow(
        data: &[Vec<f64>],
        rows: &mut Vec<usize>,
        depth_limit: usize,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let mut nodes = Vec::new();
        Self::grow_node(data, rows, 0, depth_limit, rng, &mut nodes);
        Self { nodes }
    }

    fn grow_node(
        data: &[Vec<f64>],
        rows: &mut Vec<usize>,
        depth: usize,
        depth_limit: usize,
        rng: &mut ChaCha8Rng,
        nodes: &mut Vec<Node>,
    ) -> usize {
        if rows.len() <= 1 || depth >= depth_limit {
            nodes.push(Node::Leaf { size: rows.len() });
            return nodes.len() - 1;
        }

        // Only features with spread at this node can split it.
        let n_features = data[rows[0]].len();
        let mut candidates = Vec::new();
        for f in 0..n_features {
            let (min, max) = feature_range(data, rows, f);
            if max > min {
                candidates.push((f, min, max));
            }
        }
        if candidates.is_empty() {
            nodes.push(Node::Leaf { size: rows.len() });
            return nodes.len() - 1;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);

        let (mut left_rows, mut right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&r| data[r][feature] < threshold);

        let index = nodes.len();
        nodes.push(Node::Leaf { size: 0 }); // placeholder, patched below
        let left = Self::grow_node(data, &mut left_rows, depth + 1, depth_limit, rng, nodes);
        let right = Self::grow_node(data, &mut right_rows, depth + 1, depth_limit, rng, nodes);
        nodes[index] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        index
    }

    /// Path length of a point, with the standard correction at leaves
    /// that still hold more than one sample.
    fn path_length(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { size } => return depth + c_factor(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average unsuccessful-search path length in a binary search tree of
/// `n` nodes; normalizes raw path lengths into comparable scores.
fn c_factor(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

fn feature_range(data: &[Vec<f64>], rows: &[usize], feature: usize) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &r in rows {
        let v = data[r][feature];
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Tree>,
    sample_size: usize,
    n_features: usize,
}

impl IsolationForest {
    /// Fit a forest of `n_estimators` trees, each on a subsample of at
    /// most `max_samples` rows drawn without replacement.
    pub fn fit(data: &[Vec<f64>], n_estimators: usize, max_samples: usize, seed: u64) -> Self {
        Self::fit_bounded(data, n_estimators, max_samples, seed, None)
            .expect("unbounded fit cannot time out")
    }

    /// Like [`fit`](Self::fit) but gives up between trees once the
    /// deadline passes. Returns `None` on timeout.
    pub fn fit_bounded(
        data: &[Vec<f64>],
        n_estimators: usize,
        max_samples: usize,
        seed: u64,
        deadline: Option<std::time::Instant>,
    ) -> Option<Self> {
        assert!(!data.is_empty(), "cannot fit on empty data");
        let sample_size = max_samples.min(data.len());
        let depth_limit = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut trees = Vec::with_capacity(n_estimators);
        for _ in 0..n_estimators {
            if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                return None;
            }
            let mut rows = subsample(data.len(), sample_size, &mut rng);
            trees.push(Tree::grow(data, &mut rows, depth_limit, &mut rng));
        }

        Some(Self {
            trees,
            sample_size,
            n_features: data[0].len(),
        })
    }

    /// Anomaly score for one row.
    pub fn score(&self, row: &[f64]) -> f64 {
        debug_assert_eq!(row.len(), self.n_features);
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|t| t.path_length(row))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = c_factor(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }

    pub fn scores(&self, data: &[Vec<f64>]) -> Vec<f64> {
        data.iter().map(|row| self.score(row)).collect()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }
}

/// `k` distinct indices out of `n`, via a partial Fisher-Yates shuffle.
fn subsample(n: usize, k: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.gen_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tight two-feature cluster with deterministic jitter.
    fn cluster(n: usize) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        (0..n)
            .map(|_| {
                vec![
                    10.0 + rng.gen_range(-1.0..1.0),
                    -5.0 + rng.gen_range(-1.0..1.0),
                ]
            })
            .collect()
    }

    #[test]
    fn test_outlier_scores_higher_than_inliers() {
        let data = cluster(512);
        let forest = IsolationForest::fit(&data, 100, 256, 42);

        let inlier_score = forest.score(&[10.0, -5.0]);
        let outlier_score = forest.score(&[80.0, 40.0]);
        assert!(
            outlier_score > inlier_score + 0.1,
            "outlier {outlier_score} vs inlier {inlier_score}"
        );
        assert!(outlier_score > 0.6);
    }

    #[test]
    fn test_scores_bounded() {
        let data = cluster(128);
        let forest = IsolationForest::fit(&data, 50, 64, 1);
        for score in forest.scores(&data) {
            assert!(score > 0.0 && score <= 1.0);
        }
    }

    #[test]
    fn test_same_seed_reproduces_scores() {
        let data = cluster(256);
        let a = IsolationForest::fit(&data, 40, 128, 99);
        let b = IsolationForest::fit(&data, 40, 128, 99);
        assert_eq!(a.scores(&data), b.scores(&data));
    }

    #[test]
    fn test_different_seed_differs() {
        let data = cluster(256);
        let a = IsolationForest::fit(&data, 40, 128, 1);
        let b = IsolationForest::fit(&data, 40, 128, 2);
        assert_ne!(a.scores(&data), b.scores(&data));
    }

    // Serialize-deserialize round trip produces identical scores on a
    // reference input.
    #[test]
    fn test_serde_round_trip_identical_scores() {
        let data = cluster(256);
        let forest = IsolationForest::fit(&data, 40, 128, 42);
        let blob = serde_json::to_vec(&forest).unwrap();
        let restored: IsolationForest = serde_json::from_slice(&blob).unwrap();
        assert_eq!(forest.scores(&data), restored.scores(&data));
    }

    #[test]
    fn test_constant_data_is_neutral() {
        let data = vec![vec![1.0, 1.0]; 64];
        let forest = IsolationForest::fit(&data, 10, 32, 3);
        let score = forest.score(&[1.0, 1.0]);
        // Every node is a leaf of identical points; scores collapse to
        // the 0.5 neutral value.
        assert!((score - 0.5).abs() < 0.1, "score {score}");
    }

    #[test]
    fn test_c_factor_monotone() {
        assert_eq!(c_factor(1), 0.0);
        assert!(c_factor(2) > 0.0);
        assert!(c_factor(256) > c_factor(16));
    }
}
