//! Isolation forest over fixed-width feature vectors

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{FeatureVector, FEATURE_COUNT};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IsolationNode {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationNode>,
    sample_size: usize,
}

impl IsolationForest {
    /// Grow `n_estimators` trees, each on a subsample of at most `max_samples`
    /// rows drawn without replacement.
    pub fn fit(
        data: &[FeatureVector],
        n_estimators: usize,
        max_samples: usize,
        rng: &mut StdRng,
    ) -> Self {
        let sample_size = max_samples.min(data.len()).max(1);
        let height_limit = (sample_size.max(2) as f64).log2().ceil() as usize;

        let trees = (0..n_estimators)
            .map(|_| {
                let indices = if data.is_empty() {
                    Vec::new()
                } else {
                    sample(rng, data.len(), sample_size).into_vec()
                };
                grow(data, indices, 0, height_limit, rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Anomaly score in `(0, 1]`; higher means easier to isolate.
    pub fn score(&self, x: &FeatureVector) -> f64 {
        let normalizer = average_path_length(self.sample_size);
        if self.trees.is_empty() || normalizer <= 0.0 {
            return 0.5;
        }

        let mean_path = self
            .trees
            .iter()
            .map(|tree| path_length(tree, x, 0))
            .sum::<f64>()
            / self.trees.len() as f64;

        2f64.powf(-mean_path / normalizer)
    }
}

fn grow(
    data: &[FeatureVector],
    indices: Vec<usize>,
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> IsolationNode {
    if depth >= height_limit || indices.len() <= 1 {
        return IsolationNode::Leaf {
            size: indices.len(),
        };
    }

    // Only features that still vary inside this node can split it.
    let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(FEATURE_COUNT);
    for feature in 0..FEATURE_COUNT {
        let (min, max) = indices.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
            let v = data[i][feature];
            (lo.min(v), hi.max(v))
        });
        // an infinite range cannot be sampled
        if max > min && (max - min).is_finite() {
            candidates.push((feature, min, max));
        }
    }

    if candidates.is_empty() {
        return IsolationNode::Leaf {
            size: indices.len(),
        };
    }

    let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
    let threshold = rng.gen_range(min..max);

    // threshold is in [min, max), so both sides are non-empty
    let (left, right): (Vec<usize>, Vec<usize>) = indices
        .into_iter()
        .partition(|&i| data[i][feature] <= threshold);

    IsolationNode::Split {
        feature,
        threshold,
        left: Box::new(grow(data, left, depth + 1, height_limit, rng)),
        right: Box::new(grow(data, right, depth + 1, height_limit, rng)),
    }
}

fn path_length(node: &IsolationNode, x: &FeatureVector, depth: usize) -> f64 {
    match node {
        IsolationNode::Leaf { size } => depth as f64 + average_path_length(*size),
        IsolationNode::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if x[*feature] <= *threshold {
                path_length(left, x, depth + 1)
            } else {
                path_length(right, x, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
pub(crate) fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cluster_with_outlier() -> Vec<FeatureVector> {
        let mut data: Vec<FeatureVector> = (0..64)
            .map(|i| {
                let v = (i % 8) as f64 * 0.1;
                [v, -v, v * 0.5, 0.2, -0.1]
            })
            .collect();
        data.push([25.0, -30.0, 40.0, 12.0, 18.0]);
        data
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        assert!(c256 > 9.0 && c256 < 11.0);
    }

    #[test]
    fn test_outlier_scores_highest() {
        let data = cluster_with_outlier();
        let mut rng = StdRng::seed_from_u64(42);
        let forest = IsolationForest::fit(&data, 100, 256, &mut rng);

        let outlier = forest.score(&data[data.len() - 1]);
        let max_inlier = data[..data.len() - 1]
            .iter()
            .map(|x| forest.score(x))
            .fold(f64::MIN, f64::max);

        assert!(outlier > max_inlier);
        assert_eq!(forest.tree_count(), 100);
        assert_eq!(forest.sample_size(), data.len());
    }

    #[test]
    fn test_same_seed_same_forest() {
        let data = cluster_with_outlier();
        let a = IsolationForest::fit(&data, 10, 32, &mut StdRng::seed_from_u64(7));
        let b = IsolationForest::fit(&data, 10, 32, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_sample_scores_neutral() {
        let data = vec![[1.0, 2.0, 3.0, 4.0, 5.0]];
        let forest = IsolationForest::fit(&data, 5, 256, &mut StdRng::seed_from_u64(1));
        assert_eq!(forest.score(&data[0]), 0.5);
    }

    #[test]
    fn test_unbounded_feature_range_does_not_split() {
        let data = vec![
            [1.5e308, 0.0, 0.0, 0.0, 0.0],
            [-1.5e308, 0.0, 0.0, 0.0, 0.0],
            [1.0, 0.1, 0.0, 0.0, 0.0],
            [2.0, 0.2, 0.0, 0.0, 0.0],
        ];
        let forest = IsolationForest::fit(&data, 20, 256, &mut StdRng::seed_from_u64(42));
        for x in &data {
            let score = forest.score(x);
            assert!(score > 0.0 && score <= 1.0);
        }
    }
}
