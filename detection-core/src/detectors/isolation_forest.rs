//! Isolation Forest detector: from-scratch, seeded tree construction over an
//! 8-feature vector per sample. Grounded on `anomaly_ml.rs`'s
//! ensemble-of-trees anomaly scorer, generalized from a supervised
//! `RandomForestClassifier` over network features to an unsupervised
//! isolation forest over operational-metric features — the spec requires
//! seeded, dependency-free tree construction, which the teacher's
//! supervised classifier doesn't provide.

use std::collections::{HashMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, AnomalyType, DetectionContext, ModelInfo, Sample};

use super::{apply_business_rules, Detector, DetectorConfig};

const FEATURE_COUNT: usize = 8;

#[derive(Debug, Clone)]
enum Node {
    Leaf { size: usize },
    Split { feature: usize, threshold: f64, left: Box<Node>, right: Box<Node> },
}

fn path_length(node: &Node, features: &[f64; FEATURE_COUNT], depth: u32) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split { feature, threshold, left, right } => {
            if features[*feature] < *threshold {
                path_length(left, features, depth + 1)
            } else {
                path_length(right, features, depth + 1)
            }
        }
    }
}

/// `c(n) = 2(ln(n-1) + gamma) - 2(n-1)/n`, the average path length of an
/// unsuccessful BST search, used to normalize isolation path lengths.
fn average_path_length(n: usize) -> f64 {
    const EULER_GAMMA: f64 = 0.5772156649;
    if n <= 1 {
        return 0.0;
    }
    let nf = n as f64;
    2.0 * ((nf - 1.0).ln() + EULER_GAMMA) - 2.0 * (nf - 1.0) / nf
}

fn build_tree(data: &[[f64; FEATURE_COUNT]], depth: u32, max_depth: u32, rng: &mut ChaCha8Rng) -> Node {
    if depth >= max_depth || data.len() <= 1 {
        return Node::Leaf { size: data.len() };
    }
    let feature = rng.gen_range(0..FEATURE_COUNT);
    let (min, max) = data.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(mn, mx), row| {
        (mn.min(row[feature]), mx.max(row[feature]))
    });
    if !(max > min) {
        return Node::Leaf { size: data.len() };
    }
    let threshold = rng.gen_range(min..max);
    let (left, right): (Vec<_>, Vec<_>) = data.iter().partition(|row| row[feature] < threshold);
    if left.is_empty() || right.is_empty() {
        return Node::Leaf { size: data.len() };
    }
    let left_data: Vec<[f64; FEATURE_COUNT]> = left.into_iter().copied().collect();
    let right_data: Vec<[f64; FEATURE_COUNT]> = right.into_iter().copied().collect();
    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(&left_data, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(&right_data, depth + 1, max_depth, rng)),
    }
}

struct SourceFeatures {
    history: VecDeque<Sample>,
    last_spike_index: Option<usize>,
    index: usize,
}

impl SourceFeatures {
    fn new() -> Self {
        Self { history: VecDeque::new(), last_spike_index: None, index: 0 }
    }

    /// Fixed 8-vector: value, normalized value, rate-of-change, local
    /// variance, z-score, moving-average ratio, percentile rank,
    /// time-since-spike. All computed from the rolling window, per the
    /// design note replacing the source's `Math.random()` placeholders.
    fn extract(&mut self, sample: &Sample, window_size: usize, spike_sigma: f64) -> [f64; FEATURE_COUNT] {
        let values: Vec<f64> = self.history.iter().map(|s| s.value).collect();
        let n = values.len();
        let (mean, std_dev) = if n > 0 {
            let mean = values.iter().sum::<f64>() / n as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
            (mean, var.sqrt())
        } else {
            (sample.value, 0.0)
        };
        let (min, max) = values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(mn, mx), v| (mn.min(*v), mx.max(*v)));
        let normalized = if n > 0 && max > min { (sample.value - min) / (max - min) } else { 0.5 };

        let rate_of_change = self.history.back().map(|prev| sample.value - prev.value).unwrap_or(0.0);

        let recent: Vec<f64> = values.iter().rev().take(10).copied().collect();
        let local_variance = if recent.len() > 1 {
            let m = recent.iter().sum::<f64>() / recent.len() as f64;
            recent.iter().map(|v| (v - m).powi(2)).sum::<f64>() / recent.len() as f64
        } else {
            0.0
        };

        let z_score = if std_dev > 0.0 { (sample.value - mean).abs() / std_dev } else { 0.0 };

        let moving_avg = if n > 0 { mean } else { sample.value };
        let ma_ratio = if moving_avg.abs() > f64::EPSILON { sample.value / moving_avg } else { 1.0 };

        let percentile_rank = if n > 0 {
            values.iter().filter(|v| **v <= sample.value).count() as f64 / n as f64
        } else {
            0.5
        };

        if z_score >= spike_sigma {
            self.last_spike_index = Some(self.index);
        }
        let time_since_spike = match self.last_spike_index {
            Some(i) => (self.index - i) as f64,
            None => window_size as f64,
        };

        self.history.push_back(sample.clone());
        while self.history.len() > window_size {
            self.history.pop_front();
        }
        self.index += 1;

        [normalized * max.max(1.0), normalized, rate_of_change, local_variance, z_score, ma_ratio, percentile_rank, time_since_spike]
    }
}

pub struct IsolationForestDetector {
    config: DetectorConfig,
    trees: Vec<Node>,
    sample_size: usize,
    max_depth: u32,
    source_features: HashMap<String, SourceFeatures>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl IsolationForestDetector {
    pub fn new() -> Self {
        Self {
            config: DetectorConfig::default(),
            trees: Vec::new(),
            sample_size: 256,
            max_depth: 8,
            source_features: HashMap::new(),
            ready: false,
            trained_at: None,
        }
    }

    fn anomaly_score(&self, features: &[f64; FEATURE_COUNT]) -> f64 {
        let avg_path = self.trees.iter().map(|tree| path_length(tree, features, 0)).sum::<f64>()
            / self.trees.len().max(1) as f64;
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.0;
        }
        let s = 2f64.powf(-avg_path / c);
        (1.0 - s).clamp(0.0, 1.0)
    }
}

impl Default for IsolationForestDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for IsolationForestDetector {
    fn configure(&mut self, config: DetectorConfig) -> Result<()> {
        self.max_depth = config.extra.get("maxDepth").and_then(|v| v.as_u64()).unwrap_or(8) as u32;
        self.config = config;
        Ok(())
    }

    fn train(&mut self, historical: &[Sample]) -> Result<()> {
        if historical.len() < self.config.min_data_points {
            self.ready = false;
            return Err(CoreError::InsufficientData { have: historical.len(), need: self.config.min_data_points });
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        self.source_features.clear();

        // Extract features for every historical sample in submission order
        // so the rolling window state matches what `Detect` will see later.
        let mut rows = Vec::with_capacity(historical.len());
        let mut by_source: HashMap<String, SourceFeatures> = HashMap::new();
        for sample in historical {
            let features_state = by_source.entry(sample.source.clone()).or_insert_with(SourceFeatures::new);
            rows.push(features_state.extract(sample, self.config.window_size, 3.0));
        }
        self.source_features = by_source;

        let num_trees = ((historical.len() / 10).clamp(10, 100)) as usize;
        let subsample_size = (256usize).min(((historical.len() as f64 * 0.8) as usize).max(1));
        self.sample_size = subsample_size;

        self.trees = (0..num_trees)
            .map(|_| {
                let mut subsample: Vec<[f64; FEATURE_COUNT]> = Vec::with_capacity(subsample_size);
                for _ in 0..subsample_size {
                    let idx = rng.gen_range(0..rows.len());
                    subsample.push(rows[idx]);
                }
                build_tree(&subsample, 0, self.max_depth, &mut rng)
            })
            .collect();

        self.ready = true;
        self.trained_at = Some(chrono::Utc::now());
        Ok(())
    }

    fn detect(&mut self, samples: &[Sample], ctx: &DetectionContext) -> Vec<Anomaly> {
        if !self.ready || !self.config.enabled {
            return Vec::new();
        }
        let mut out = Vec::new();
        for sample in samples {
            if ctx.is_in_maintenance(sample.timestamp) {
                continue;
            }
            let window_size = self.config.window_size;
            let state = self.source_features.entry(sample.source.clone()).or_insert_with(SourceFeatures::new);
            let features = state.extract(sample, window_size, 3.0);
            let score = self.anomaly_score(&features);
            if score < self.config.threshold {
                continue;
            }

            let path_lengths: Vec<f64> = self.trees.iter().map(|t| path_length(t, &features, 0)).collect();
            let mean_path = path_lengths.iter().sum::<f64>() / path_lengths.len().max(1) as f64;
            let variance = path_lengths.iter().map(|p| (p - mean_path).powi(2)).sum::<f64>() / path_lengths.len().max(1) as f64;
            let confidence = (0.5 + 0.5 * (1.0 - (variance.sqrt() / mean_path.max(1e-9)).min(1.0))).clamp(0.0, 1.0);

            let kind = if features[2] > 0.0 { AnomalyType::Spike } else { AnomalyType::Outlier };
            let anomaly = Anomaly::new(
                kind,
                score,
                confidence * (0.5 + 0.5 * self.config.sensitivity),
                sample.clone(),
                format!("isolation score {:.3} exceeds threshold {:.3}", score, self.config.threshold),
                None,
                score,
                AnomalyContext {
                    metric: sample.metric.clone(),
                    labels: sample.labels.clone(),
                    window_size: Some(window_size),
                    algorithm: "isolation_forest".into(),
                    threshold: Some(self.config.threshold),
                    ..Default::default()
                },
            );
            if let Some(anomaly) = apply_business_rules(anomaly, &self.config.business_rules) {
                out.push(anomaly);
            }
        }
        out
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn reset(&mut self) {
        self.trees.clear();
        self.source_features.clear();
        self.ready = false;
        self.trained_at = None;
    }

    fn model_info(&self) -> ModelInfo {
        let mut params = HashMap::new();
        params.insert("num_trees".to_string(), serde_json::json!(self.trees.len()));
        params.insert("sample_size".to_string(), serde_json::json!(self.sample_size));
        ModelInfo {
            algorithm: "isolation_forest".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: Some(self.sample_size),
            parameters: params,
        }
    }

    fn name(&self) -> &str {
        "isolation_forest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_detector(seed: u64) -> (IsolationForestDetector, Vec<Sample>) {
        let mut detector = IsolationForestDetector::new();
        detector
            .configure(DetectorConfig { threshold: 0.6, window_size: 200, min_data_points: 50, seed, ..Default::default() })
            .unwrap();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let historical: Vec<Sample> = (0..200)
            .map(|i| Sample::new("s1", "cpu", 50.0 + rng.gen_range(-2.0..2.0), i as i64 * 1000))
            .collect();
        detector.train(&historical).unwrap();
        (detector, historical)
    }

    #[test]
    fn deterministic_given_same_seed() {
        let (mut a, historical) = train_detector(42);
        let (mut b, _) = train_detector(42);
        let ctx = DetectionContext::default();
        let sample = Sample::new("s1", "cpu", 50.0, historical.len() as i64 * 1000);
        let score_a = a.anomaly_score(&a.source_features.get_mut("s1").unwrap().extract(&sample, 200, 3.0));
        let score_b = b.anomaly_score(&b.source_features.get_mut("s1").unwrap().extract(&sample, 200, 3.0));
        assert_eq!(score_a, score_b);
    }

    #[test]
    fn extreme_outlier_scores_higher_than_training_mean() {
        let (mut detector, historical) = train_detector(1);
        let ctx = DetectionContext::default();
        let mean_sample = Sample::new("s1", "cpu", 50.0, historical.len() as i64 * 1000 + 1000);
        let extreme_sample = Sample::new("s1", "cpu", 50.0 + 100.0, historical.len() as i64 * 1000 + 2000);

        let mean_features = detector.source_features.get_mut("s1").unwrap().extract(&mean_sample, 200, 3.0);
        let mean_score = detector.anomaly_score(&mean_features);
        let extreme_features = detector.source_features.get_mut("s1").unwrap().extract(&extreme_sample, 200, 3.0);
        let extreme_score = detector.anomaly_score(&extreme_features);
        assert!(extreme_score > mean_score);
        let _ = ctx;
    }

    #[test]
    fn train_with_too_few_points_fails() {
        let mut detector = IsolationForestDetector::new();
        detector.configure(DetectorConfig { min_data_points: 50, ..Default::default() }).unwrap();
        let few: Vec<Sample> = (0..10).map(|i| Sample::new("s", "m", i as f64, i)).collect();
        assert!(detector.train(&few).is_err());
        assert!(!detector.is_ready());
    }
}
