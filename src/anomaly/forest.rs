//! Isolation forest over standardized features

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::anomaly::model::{OutlierFitter, OutlierModel, TrainingError};

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Per-feature mean/standard deviation scaler
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(samples: &[Vec<f64>]) -> Self {
        let dims = samples.first().map_or(0, Vec::len);
        let n = samples.len().max(1) as f64;

        let mut mean = vec![0.0; dims];
        for sample in samples {
            for (m, v) in mean.iter_mut().zip(sample) {
                *m += v / n;
            }
        }

        let mut std = vec![0.0; dims];
        for sample in samples {
            for ((s, v), m) in std.iter_mut().zip(sample).zip(&mean) {
                *s += (v - m).powi(2) / n;
            }
        }
        // Constant features are centred but not scaled
        let std = std
            .into_iter()
            .map(|variance| if variance > f64::EPSILON { variance.sqrt() } else { 1.0 })
            .collect();

        StandardScaler { mean, std }
    }

    pub fn transform(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

#[derive(Debug, Clone)]
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

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(samples: &[Vec<f64>], height_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = IsolationTree { nodes: Vec::new() };
        let rows: Vec<&[f64]> = samples.iter().map(Vec::as_slice).collect();
        tree.grow(rows, 0, height_limit, rng);
        tree
    }

    fn grow(&mut self, rows: Vec<&[f64]>, depth: usize, height_limit: usize, rng: &mut StdRng) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });

        if depth >= height_limit || rows.len() <= 1 {
            return id;
        }

        // Only features that still vary within this node can split it
        let dims = rows[0].len();
        let candidates: Vec<(usize, f64, f64)> = (0..dims)
            .filter_map(|feature| {
                let (min, max) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), row| {
                    (lo.min(row[feature]), hi.max(row[feature]))
                });
                (max > min).then_some((feature, min, max))
            })
            .collect();
        if candidates.is_empty() {
            return id;
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(min..max);
        let (left_rows, right_rows): (Vec<&[f64]>, Vec<&[f64]>) =
            rows.into_iter().partition(|row| row[feature] < threshold);

        let left = self.grow(left_rows, depth + 1, height_limit, rng);
        let right = self.grow(right_rows, depth + 1, height_limit, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, values: &[f64]) -> f64 {
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
                    let value = values.get(*feature).copied().unwrap_or_default();
                    node = if value < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful search in a binary search tree of `n` nodes
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

/// A fitted isolation forest
#[derive(Debug, Clone)]
pub struct IsolationForest {
    scaler: StandardScaler,
    trees: Vec<IsolationTree>,
    normalizer: f64,
}

impl OutlierModel for IsolationForest {
    fn score(&self, values: &[f64]) -> f64 {
        if self.trees.is_empty() || self.normalizer <= 0.0 {
            return 0.0;
        }
        let scaled = self.scaler.transform(values);
        let mean_path = self.trees.iter().map(|t| t.path_length(&scaled)).sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_path / self.normalizer)
    }
}

/// Fits [`IsolationForest`] models with a fixed seed
#[derive(Debug, Clone)]
pub struct IsolationForestFitter {
    pub trees: usize,
    pub sample_size: usize,
    pub seed: u64,
}

impl IsolationForestFitter {
    pub fn new(trees: usize, sample_size: usize, seed: u64) -> Self {
        IsolationForestFitter {
            trees,
            sample_size,
            seed,
        }
    }
}

impl OutlierFitter for IsolationForestFitter {
    fn fit(&self, samples: &[Vec<f64>]) -> Result<Box<dyn OutlierModel>, TrainingError> {
        let dims = samples
            .first()
            .map(Vec::len)
            .ok_or(TrainingError::InsufficientSamples { have: 0, need: 2 })?;
        if samples.len() < 2 {
            return Err(TrainingError::InsufficientSamples {
                have: samples.len(),
                need: 2,
            });
        }
        if dims == 0 || samples.iter().any(|s| s.len() != dims) {
            return Err(TrainingError::InvalidData("samples have inconsistent dimensions".to_string()));
        }
        if samples.iter().flatten().any(|v| !v.is_finite()) {
            return Err(TrainingError::InvalidData("samples contain non-finite values".to_string()));
        }

        let scaler = StandardScaler::fit(samples);
        let scaled: Vec<Vec<f64>> = samples.iter().map(|s| scaler.transform(s)).collect();

        let psi = self.sample_size.clamp(2, scaled.len());
        let height_limit = (psi as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let trees = (0..self.trees.max(1))
            .map(|_| {
                let subset: Vec<Vec<f64>> = index::sample(&mut rng, scaled.len(), psi)
                    .into_iter()
                    .map(|i| scaled[i].clone())
                    .collect();
                IsolationTree::build(&subset, height_limit, &mut rng)
            })
            .collect();

        Ok(Box::new(IsolationForest {
            scaler,
            trees,
            normalizer: average_path_length(psi),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(n: usize) -> Vec<Vec<f64>> {
        // Regular grid around (10, 50, 0)
        (0..n)
            .map(|i| {
                let a = (i % 10) as f64 * 0.1;
                let b = ((i / 10) % 10) as f64 * 0.1;
                vec![10.0 + a, 50.0 + b, 0.0]
            })
            .collect()
    }

    #[test]
    fn test_scaler_standardizes() {
        let samples = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let scaler = StandardScaler::fit(&samples);
        assert_eq!(scaler.transform(&[2.0, 5.0]), vec![0.0, 0.0]);
        assert_eq!(scaler.transform(&[3.0, 6.0]), vec![1.0, 1.0]);
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        assert!((c256 - 10.24).abs() < 0.05, "c(256) = {}", c256);
    }

    #[test]
    fn test_outlier_scores_higher_than_inlier() {
        let fitter = IsolationForestFitter::new(100, 64, 42);
        let model = fitter.fit(&cluster(200)).unwrap();

        let inlier = model.score(&[10.45, 50.45, 0.0]);
        let outlier = model.score(&[40.0, 5.0, 3.0]);

        assert!((0.0..=1.0).contains(&inlier));
        assert!((0.0..=1.0).contains(&outlier));
        assert!(outlier > inlier, "outlier {} <= inlier {}", outlier, inlier);
        assert!(outlier > 0.5, "outlier score {}", outlier);
    }

    #[test]
    fn test_fit_is_deterministic_for_a_seed() {
        let samples = cluster(100);
        let a = IsolationForestFitter::new(20, 32, 7).fit(&samples).unwrap();
        let b = IsolationForestFitter::new(20, 32, 7).fit(&samples).unwrap();
        let probe = [12.0, 49.0, 1.0];
        assert_eq!(a.score(&probe), b.score(&probe));
    }

    #[test]
    fn test_rejects_bad_samples() {
        let fitter = IsolationForestFitter::new(10, 16, 1);
        assert!(matches!(fitter.fit(&[]), Err(TrainingError::InsufficientSamples { .. })));
        assert!(matches!(
            fitter.fit(&[vec![1.0, 2.0], vec![1.0]]),
            Err(TrainingError::InvalidData(_))
        ));
        assert!(matches!(
            fitter.fit(&[vec![f64::NAN], vec![1.0]]),
            Err(TrainingError::InvalidData(_))
        ));
    }
}
