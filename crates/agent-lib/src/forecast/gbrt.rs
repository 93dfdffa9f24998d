//! Gradient-boosted regression trees
//!
//! Small least-squares boosting ensemble over lag-window features. Each
//! stage fits a shallow tree to the current residuals; prediction is the
//! base value plus the shrunken sum of tree outputs.

use serde::{Deserialize, Serialize};

/// Boosting stages.
const N_STAGES: usize = 50;

/// Shrinkage applied to every stage.
const LEARNING_RATE: f64 = 0.1;

/// Maximum tree depth.
const MAX_DEPTH: usize = 3;

/// Minimum rows in a leaf.
const MIN_LEAF: usize = 4;

/// Candidate split thresholds probed per feature.
const SPLIT_CANDIDATES: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn fit(data: &[Vec<f64>], targets: &[f64], rows: &mut Vec<usize>) -> Self {
        let mut nodes = Vec::new();
        Self::fit_node(data, targets, rows, 0, &mut nodes);
        Self { nodes }
    }

    fn fit_node(
        data: &[Vec<f64>],
        targets: &[f64],
        rows: &mut Vec<usize>,
        depth: usize,
        nodes: &mut Vec<Node>,
    ) -> usize {
        let node_mean = mean_of(targets, rows);
        if depth >= MAX_DEPTH || rows.len() < 2 * MIN_LEAF {
            nodes.push(Node::Leaf { value: node_mean });
            return nodes.len() - 1;
        }

        match best_split(data, targets, rows) {
            None => {
                nodes.push(Node::Leaf { value: node_mean });
                nodes.len() - 1
            }
            Some((feature, threshold)) => {
                let (mut left_rows, mut right_rows): (Vec<usize>, Vec<usize>) =
                    rows.iter().partition(|&&r| data[r][feature] < threshold);
                if left_rows.len() < MIN_LEAF || right_rows.len() < MIN_LEAF {
                    nodes.push(Node::Leaf { value: node_mean });
                    return nodes.len() - 1;
                }
                let index = nodes.len();
                nodes.push(Node::Leaf { value: node_mean }); // patched below
                let left = Self::fit_node(data, targets, &mut left_rows, depth + 1, nodes);
                let right = Self::fit_node(data, targets, &mut right_rows, depth + 1, nodes);
                nodes[index] = Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                };
                index
            }
        }
    }

    fn predict(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }
}

fn mean_of(targets: &[f64], rows: &[usize]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter().map(|&r| targets[r]).sum::<f64>() / rows.len() as f64
}

/// Greedy SSE-minimizing split over quantile candidates of each feature.
fn best_split(data: &[Vec<f64>], targets: &[f64], rows: &[usize]) -> Option<(usize, f64)> {
    let n_features = data[rows[0]].len();
    let parent_mean = mean_of(targets, rows);
    let parent_sse: f64 = rows
        .iter()
        .map(|&r| (targets[r] - parent_mean).powi(2))
        .sum();

    let mut best: Option<(usize, f64, f64)> = None;
    for feature in 0..n_features {
        let mut values: Vec<f64> = rows.iter().map(|&r| data[r][feature]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        if values.len() < 2 {
            continue;
        }
        for k in 1..=SPLIT_CANDIDATES {
            let pos = k * (values.len() - 1) / (SPLIT_CANDIDATES + 1);
            let threshold = (values[pos] + values[(pos + 1).min(values.len() - 1)]) / 2.0;

            let (left, right): (Vec<usize>, Vec<usize>) =
                rows.iter().partition(|&&r| data[r][feature] < threshold);
            if left.len() < MIN_LEAF || right.len() < MIN_LEAF {
                continue;
            }
            let lm = mean_of(targets, &left);
            let rm = mean_of(targets, &right);
            let sse: f64 = left.iter().map(|&r| (targets[r] - lm).powi(2)).sum::<f64>()
                + right.iter().map(|&r| (targets[r] - rm).powi(2)).sum::<f64>();
            if sse < parent_sse && best.map_or(true, |(_, _, b)| sse < b) {
                best = Some((feature, threshold, sse));
            }
        }
    }
    best.map(|(f, t, _)| (f, t))
}

/// Boosted ensemble with a constant base prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoost {
    base: f64,
    trees: Vec<Tree>,
}

impl GradientBoost {
    /// Fit on row-major features and their targets.
    pub fn fit(data: &[Vec<f64>], targets: &[f64]) -> Self {
        assert_eq!(data.len(), targets.len());
        assert!(!data.is_empty());

        let base = targets.iter().sum::<f64>() / targets.len() as f64;
        let mut residuals: Vec<f64> = targets.iter().map(|t| t - base).collect();
        let mut trees = Vec::with_capacity(N_STAGES);

        for _ in 0..N_STAGES {
            let mut rows: Vec<usize> = (0..data.len()).collect();
            let tree = Tree::fit(data, &residuals, &mut rows);
            for (i, row) in data.iter().enumerate() {
                residuals[i] -= LEARNING_RATE * tree.predict(row);
            }
            trees.push(tree);
        }

        Self { base, trees }
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base
            + self
                .trees
                .iter()
                .map(|t| LEARNING_RATE * t.predict(row))
                .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_step_function() {
        // y = 10 for x < 0.5, y = 20 otherwise.
        let data: Vec<Vec<f64>> = (0..200).map(|i| vec![i as f64 / 200.0]).collect();
        let targets: Vec<f64> = data
            .iter()
            .map(|row| if row[0] < 0.5 { 10.0 } else { 20.0 })
            .collect();

        let model = GradientBoost::fit(&data, &targets);
        assert!((model.predict(&[0.2]) - 10.0).abs() < 1.0);
        assert!((model.predict(&[0.8]) - 20.0).abs() < 1.0);
    }

    #[test]
    fn test_fits_next_value_from_lags() {
        // Next value continues a ramp: target = last lag + 1.
        let data: Vec<Vec<f64>> = (0..300)
            .map(|i| vec![i as f64, i as f64 + 1.0, i as f64 + 2.0])
            .collect();
        let targets: Vec<f64> = data.iter().map(|row| row[2] + 1.0).collect();

        let model = GradientBoost::fit(&data, &targets);
        // Interpolates within the training range.
        let pred = model.predict(&[150.0, 151.0, 152.0]);
        assert!((pred - 153.0).abs() < 8.0, "pred {pred}");
    }

    #[test]
    fn test_serde_round_trip() {
        let data: Vec<Vec<f64>> = (0..100).map(|i| vec![i as f64]).collect();
        let targets: Vec<f64> = data.iter().map(|row| row[0] * 2.0).collect();
        let model = GradientBoost::fit(&data, &targets);

        let blob = serde_json::to_vec(&model).unwrap();
        let restored: GradientBoost = serde_json::from_slice(&blob).unwrap();
        for row in &data {
            assert_eq!(model.predict(row), restored.predict(row));
        }
    }
}

