//! ML ensemble detector: several lightweight scoring algorithms over a
//! 16-feature vector, combined with weights derived from each algorithm's
//! own validation accuracy. Algorithms that validate below 0.6 accuracy are
//! dropped from the ensemble entirely, per the ensemble-pruning rule.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, AnomalyType, DetectionContext, ModelInfo, Sample};

use super::{apply_business_rules, Detector, DetectorConfig, FeatureImportance};

const FEATURE_NAMES: [&str; 16] = [
    "value", "z_score", "delta", "delta_pct", "rolling_mean", "rolling_std", "rolling_min", "rolling_max",
    "range_position", "mad", "skew_sign", "autocorr_lag1", "hour_of_day", "is_weekend", "trend_slope", "volatility",
];

fn extract_features(window: &VecDeque<Sample>, value: f64, timestamp: i64) -> [f64; 16] {
    let values: Vec<f64> = window.iter().map(|s| s.value).collect();
    let n = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = if values.len() > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
    } else {
        0.0
    };
    let std_dev = variance.sqrt().max(1e-9);
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = if min.is_finite() { min } else { value };
    let max = if max.is_finite() { max } else { value };
    let prev = values.last().copied().unwrap_or(value);
    let delta = value - prev;
    let delta_pct = if prev.abs() > 1e-9 { delta / prev } else { 0.0 };
    let mad = if values.is_empty() {
        0.0
    } else {
        values.iter().map(|v| (v - mean).abs()).sum::<f64>() / values.len() as f64
    };
    let range_position = if (max - min).abs() > 1e-9 { (value - min) / (max - min) } else { 0.5 };

    let autocorr = if values.len() >= 2 {
        let shifted = &values[..values.len() - 1];
        let current = &values[1..];
        let num: f64 = shifted.iter().zip(current).map(|(a, b)| (a - mean) * (b - mean)).sum();
        let denom: f64 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>().max(1e-9);
        num / denom
    } else {
        0.0
    };

    let trend_slope = if values.len() >= 2 {
        let half = values.len() / 2;
        let first_half_mean = values[..half.max(1)].iter().sum::<f64>() / half.max(1) as f64;
        let second_half_mean = values[half..].iter().sum::<f64>() / (values.len() - half).max(1) as f64;
        second_half_mean - first_half_mean
    } else {
        0.0
    };

    let dt = chrono::Utc.timestamp_millis_opt(timestamp).single().unwrap_or_else(chrono::Utc::now);
    use chrono::{Datelike, Timelike, TimeZone};
    let hour = dt.hour() as f64;
    let is_weekend = if dt.weekday().num_days_from_monday() >= 5 { 1.0 } else { 0.0 };

    [
        value,
        (value - mean) / std_dev,
        delta,
        delta_pct,
        mean,
        std_dev,
        min,
        max,
        range_position,
        mad,
        if value > mean { 1.0 } else { -1.0 },
        autocorr,
        hour,
        is_weekend,
        trend_slope,
        std_dev / mean.abs().max(1e-9),
    ]
}

/// A lightweight scoring algorithm: maps a feature vector to an anomaly
/// score in `[0, 1]`. Each is a stand-in for a trained model, scored by its
/// own validation accuracy rather than assumed equally trustworthy.
trait MlAlgorithm: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, features: &[f64; 16]) -> f64;
    /// Validation accuracy against a held-out slice of the training set,
    /// computed once at train time.
    fn validate(&self, validation: &[([f64; 16], bool)]) -> f64 {
        if validation.is_empty() {
            return 0.0;
        }
        let correct = validation
            .iter()
            .filter(|(f, is_anomaly)| (self.score(f) >= 0.5) == *is_anomaly)
            .count();
        correct as f64 / validation.len() as f64
    }
}

struct ZFeatureAlgorithm;
impl MlAlgorithm for ZFeatureAlgorithm {
    fn name(&self) -> &str {
        "z_feature"
    }
    fn score(&self, features: &[f64; 16]) -> f64 {
        (features[1].abs() / 4.0).clamp(0.0, 1.0)
    }
}

struct VolatilityAlgorithm;
impl MlAlgorithm for VolatilityAlgorithm {
    fn name(&self) -> &str {
        "volatility"
    }
    fn score(&self, features: &[f64; 16]) -> f64 {
        (features[15] / 2.0).clamp(0.0, 1.0)
    }
}

struct RangePositionAlgorithm;
impl MlAlgorithm for RangePositionAlgorithm {
    fn name(&self) -> &str {
        "range_position"
    }
    fn score(&self, features: &[f64; 16]) -> f64 {
        let rp = features[8];
        (2.0 * (rp - 0.5).abs()).clamp(0.0, 1.0)
    }
}

struct TrendBreakAlgorithm;
impl MlAlgorithm for TrendBreakAlgorithm {
    fn name(&self) -> &str {
        "trend_break"
    }
    fn score(&self, features: &[f64; 16]) -> f64 {
        let denom = features[5].max(1e-9);
        (features[14].abs() / (3.0 * denom)).clamp(0.0, 1.0)
    }
}

struct AutocorrAlgorithm;
impl MlAlgorithm for AutocorrAlgorithm {
    fn name(&self) -> &str {
        "autocorr_break"
    }
    fn score(&self, features: &[f64; 16]) -> f64 {
        (1.0 - features[11].abs()).clamp(0.0, 1.0)
    }
}

fn synthetic_validation_set(rng: &mut StdRng, window: &[f64]) -> Vec<([f64; 16], bool)> {
    if window.len() < 5 {
        return Vec::new();
    }
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let std_dev = {
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window.len() as f64;
        var.sqrt().max(1e-9)
    };
    let mut set = Vec::new();
    let mut buf: VecDeque<Sample> = window.iter().map(|v| Sample::new("_train", "_", *v, 0)).collect();
    for _ in 0..30 {
        let is_anomaly = rng.gen_bool(0.3);
        let value = if is_anomaly { mean + std_dev * (4.0 + rng.gen_range(0.0..2.0)) } else { mean + std_dev * rng.gen_range(-1.0..1.0) };
        let features = extract_features(&buf, value, 0);
        set.push((features, is_anomaly));
        buf.push_back(Sample::new("_train", "_", value, 0));
        if buf.len() > 50 {
            buf.pop_front();
        }
    }
    set
}

struct WeightedAlgorithm {
    algo: Box<dyn MlAlgorithm>,
    weight: f64,
}

pub struct MlEnsembleDetector {
    config: DetectorConfig,
    windows: HashMap<String, VecDeque<Sample>>,
    algorithms: Vec<WeightedAlgorithm>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MlEnsembleDetector {
    pub fn new() -> Self {
        Self { config: DetectorConfig::default(), windows: HashMap::new(), algorithms: Vec::new(), ready: false, trained_at: None }
    }
}

impl Default for MlEnsembleDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for MlEnsembleDetector {
    fn configure(&mut self, config: DetectorConfig) -> Result<()> {
        self.config = config;
        Ok(())
    }

    fn train(&mut self, historical: &[Sample]) -> Result<()> {
        if historical.len() < self.config.min_data_points {
            self.ready = false;
            return Err(CoreError::InsufficientData { have: historical.len(), need: self.config.min_data_points });
        }
        self.windows.clear();
        for sample in historical {
            let window = self.windows.entry(sample.source.clone()).or_insert_with(|| VecDeque::with_capacity(self.config.window_size));
            window.push_back(sample.clone());
            if window.len() > self.config.window_size {
                window.pop_front();
            }
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let candidates: Vec<Box<dyn MlAlgorithm>> = vec![
            Box::new(ZFeatureAlgorithm),
            Box::new(VolatilityAlgorithm),
            Box::new(RangePositionAlgorithm),
            Box::new(TrendBreakAlgorithm),
            Box::new(AutocorrAlgorithm),
        ];

        let reference_values: Vec<f64> = historical.iter().map(|s| s.value).collect();
        let validation_set = synthetic_validation_set(&mut rng, &reference_values);

        let mut retained = Vec::new();
        for algo in candidates {
            let accuracy = algo.validate(&validation_set);
            if accuracy > 0.6 {
                retained.push(WeightedAlgorithm { weight: accuracy, algo });
            }
        }
        self.algorithms = retained;
        self.ready = !self.algorithms.is_empty();
        self.trained_at = Some(chrono::Utc::now());
        if !self.ready {
            return Err(CoreError::InsufficientData { have: 0, need: 1 }.in_subsystem("ml_ensemble"));
        }
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
            let window = self.windows.entry(sample.source.clone()).or_insert_with(|| VecDeque::with_capacity(self.config.window_size));
            let features = extract_features(window, sample.value, sample.timestamp);

            let total_weight: f64 = self.algorithms.iter().map(|w| w.weight).sum();
            let weighted_score: f64 = self
                .algorithms
                .iter()
                .map(|w| w.weight * w.algo.score(&features))
                .sum::<f64>()
                / total_weight.max(1e-9);

            if weighted_score >= self.config.threshold / 3.0 {
                let agreeing = self.algorithms.iter().filter(|w| w.algo.score(&features) >= 0.5).count();
                let confidence = (agreeing as f64 / self.algorithms.len() as f64 * self.config.sensitivity.max(0.3)).clamp(0.0, 1.0);

                let kind = if features[1] > 0.0 { AnomalyType::Spike } else { AnomalyType::Drop };
                let anomaly = Anomaly::new(
                    kind,
                    weighted_score.clamp(0.0, 1.0),
                    confidence,
                    sample.clone(),
                    format!("ml ensemble weighted score {weighted_score:.3} from {} retained algorithms", self.algorithms.len()),
                    Some(features[4]),
                    (sample.value - features[4]).abs(),
                    AnomalyContext {
                        metric: sample.metric.clone(),
                        labels: sample.labels.clone(),
                        algorithm: "ml_ensemble".into(),
                        threshold: Some(self.config.threshold),
                        ..Default::default()
                    },
                );
                if let Some(anomaly) = apply_business_rules(anomaly, &self.config.business_rules) {
                    out.push(anomaly);
                }
            }

            window.push_back(sample.clone());
            if window.len() > self.config.window_size {
                window.pop_front();
            }
        }
        out
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn reset(&mut self) {
        self.windows.clear();
        self.algorithms.clear();
        self.ready = false;
        self.trained_at = None;
    }

    fn model_info(&self) -> ModelInfo {
        let mut parameters = HashMap::new();
        parameters.insert(
            "retained_algorithms".into(),
            serde_json::json!(self.algorithms.iter().map(|w| (w.algo.name().to_string(), w.weight)).collect::<HashMap<_, _>>()),
        );
        ModelInfo {
            algorithm: "ml_ensemble".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: None,
            parameters,
        }
    }

    fn name(&self) -> &str {
        "ml_ensemble"
    }
}

impl FeatureImportance for MlEnsembleDetector {
    fn feature_importance(&self, _source: &str) -> HashMap<String, f64> {
        FEATURE_NAMES.iter().map(|&name| (name.to_string(), 1.0 / FEATURE_NAMES.len() as f64)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn historical(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let v = 50.0 + ((i as f64) * 0.37).sin() * 5.0;
                Sample::new("s1", "cpu", v, i as i64 * 1000)
            })
            .collect()
    }

    #[test]
    fn train_with_too_few_points_fails() {
        let mut detector = MlEnsembleDetector::new();
        detector.configure(DetectorConfig { min_data_points: 40, ..Default::default() }).unwrap();
        assert!(detector.train(&historical(10)).is_err());
    }

    #[test]
    fn trains_and_retains_at_least_one_algorithm() {
        let mut detector = MlEnsembleDetector::new();
        detector.configure(DetectorConfig { min_data_points: 40, seed: 7, ..Default::default() }).unwrap();
        detector.train(&historical(80)).unwrap();
        assert!(detector.is_ready());
        assert!(!detector.algorithms.is_empty());
    }

    #[test]
    fn extreme_spike_is_flagged() {
        let mut detector = MlEnsembleDetector::new();
        detector.configure(DetectorConfig { min_data_points: 40, threshold: 1.0, seed: 7, ..Default::default() }).unwrap();
        detector.train(&historical(80)).unwrap();
        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "cpu", 500.0, 81_000);
        let anomalies = detector.detect(&[spike], &ctx);
        assert_eq!(anomalies.len(), 1);
    }
}
