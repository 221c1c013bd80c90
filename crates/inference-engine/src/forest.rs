//! Isolation Forest
//!
//! Ensemble of randomized partitioning trees. Points that are isolated in few
//! splits are outliers. Scores follow the usual convention:
//! `score_samples` is the negated anomaly score in [-1, 0], and
//! `decision_function` subtracts the contamination offset so negative values
//! are anomalous.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Euler–Mascheroni constant
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Errors from the forest itself
#[derive(Debug, Clone, Error)]
pub enum ForestError {
    #[error("Cannot fit on an empty sample set")]
    Empty,
    #[error("Invalid input shape: expected {expected} features, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("Input contains non-finite values")]
    NonFinite,
    #[error("Invalid forest config: {0}")]
    InvalidConfig(String),
}

/// Forest hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    /// Number of trees
    pub n_estimators: usize,
    /// Expected fraction of anomalies in the training set
    pub contamination: f64,
    /// Upper bound on rows drawn per tree
    pub max_samples: usize,
    /// RNG seed
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            contamination: 0.05,
            max_samples: 256,
            seed: 42,
        }
    }
}

impl ForestConfig {
    fn validate(&self) -> Result<(), ForestError> {
        if self.n_estimators == 0 {
            return Err(ForestError::InvalidConfig("n_estimators must be > 0".to_string()));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(ForestError::InvalidConfig(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.max_samples == 0 {
            return Err(ForestError::InvalidConfig("max_samples must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(data: &[Vec<f64>], rows: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(data, rows, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        data: &[Vec<f64>],
        rows: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });

        if depth >= max_depth || rows.len() <= 1 {
            return id;
        }

        // Only features that still vary within this node can split it.
        let n_features = data[rows[0]].len();
        let candidates: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|f| {
                let (min, max) = rows.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &r| {
                    (lo.min(data[r][f]), hi.max(data[r][f]))
                });
                (max > min).then_some((f, min, max))
            })
            .collect();
        if candidates.is_empty() {
            return id;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| data[r][feature] <= threshold);

        let left = self.grow(data, left_rows, depth + 1, max_depth, rng);
        let right = self.grow(data, right_rows, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, x: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if x[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search among `n` points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated percentile (`q` in [0, 100]) of unsorted values
fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// A fitted isolation forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    n_features: usize,
    /// Rows actually drawn per tree
    max_samples: usize,
    /// Threshold on `score_samples` separating inliers from outliers
    offset: f64,
}

impl IsolationForest {
    /// Fit on `samples` (one row per training instance)
    pub fn fit(samples: &[Vec<f64>], config: &ForestConfig) -> Result<Self, ForestError> {
        config.validate()?;
        let first = samples.first().ok_or(ForestError::Empty)?;
        let n_features = first.len();
        for row in samples {
            if row.len() != n_features {
                return Err(ForestError::ShapeMismatch {
                    expected: n_features,
                    actual: row.len(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(ForestError::NonFinite);
            }
        }

        let n = samples.len();
        let max_samples = config.max_samples.min(n);
        let max_depth = (max_samples.max(2) as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let trees: Vec<IsolationTree> = (0..config.n_estimators)
            .map(|_| {
                let rows = rand::seq::index::sample(&mut rng, n, max_samples).into_vec();
                IsolationTree::build(samples, rows, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            n_features,
            max_samples,
            offset: 0.0,
        };

        let training_scores: Vec<f64> = samples.iter().map(|x| forest.raw_score(x)).collect();
        forest.offset = percentile(&training_scores, 100.0 * config.contamination);

        debug!(
            "Fitted isolation forest: {} trees, {} rows ({} per tree), {} features, offset {:.4}",
            forest.trees.len(),
            n,
            max_samples,
            n_features,
            forest.offset
        );
        Ok(forest)
    }

    fn check(&self, x: &[f64]) -> Result<(), ForestError> {
        if x.len() != self.n_features {
            return Err(ForestError::ShapeMismatch {
                expected: self.n_features,
                actual: x.len(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ForestError::NonFinite);
        }
        Ok(())
    }

    fn raw_score(&self, x: &[f64]) -> f64 {
        let mean_depth =
            self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64;
        let normalizer = average_path_length(self.max_samples);
        // With a single training row every path is zero length: ratio is taken as 1.
        let ratio = if normalizer > 0.0 { mean_depth / normalizer } else { 1.0 };
        -(2f64.powf(-ratio))
    }

    /// Negated anomaly score; lower is more abnormal
    pub fn score_samples(&self, x: &[f64]) -> Result<f64, ForestError> {
        self.check(x)?;
        Ok(self.raw_score(x))
    }

    /// `score_samples - offset`; negative means anomalous
    pub fn decision_function(&self, x: &[f64]) -> Result<f64, ForestError> {
        Ok(self.score_samples(x)? - self.offset)
    }

    /// Whether `x` is an outlier
    pub fn is_anomaly(&self, x: &[f64]) -> Result<bool, ForestError> {
        Ok(self.decision_function(x)? < 0.0)
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }
}
