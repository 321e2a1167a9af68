//! K-nearest-neighbors outlier detector: a per-source training buffer plus
//! distance-weighted voting over the `k` closest historical points.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, AnomalyType, DetectionContext, ModelInfo, Sample};

use super::{apply_business_rules, Detector, DetectorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Euclidean,
    Manhattan,
    Cosine,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        DistanceMetric::Euclidean
    }
}

fn distance(a: &[f64], b: &[f64], metric: DistanceMetric) -> f64 {
    match metric {
        DistanceMetric::Euclidean => a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt(),
        DistanceMetric::Manhattan => a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum(),
        DistanceMetric::Cosine => {
            let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
            if na <= 0.0 || nb <= 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
    }
}

/// Partial selection of the `k` smallest distances, avoiding a full sort
/// over the whole training buffer.
fn k_smallest(mut distances: Vec<f64>, k: usize) -> Vec<f64> {
    let k = k.min(distances.len());
    if k == 0 {
        return Vec::new();
    }
    let idx = k - 1;
    distances.select_nth_unstable_by(idx, |a, b| a.partial_cmp(b).unwrap());
    let mut slice: Vec<f64> = distances[..k].to_vec();
    slice.sort_by(|a, b| a.partial_cmp(b).unwrap());
    slice
}

fn feature_vector(window: &VecDeque<f64>, value: f64) -> Vec<f64> {
    let n = window.len().max(1) as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = if window.len() > 1 {
        window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window.len() - 1) as f64
    } else {
        0.0
    };
    let std_dev = variance.sqrt().max(1e-9);
    let z = (value - mean) / std_dev;
    let prev = window.back().copied().unwrap_or(value);
    let delta = value - prev;
    vec![value, z, delta]
}

struct SourceBuffer {
    window: VecDeque<f64>,
    training_points: Vec<Vec<f64>>,
}

pub struct KnnDetector {
    config: DetectorConfig,
    k: usize,
    metric: DistanceMetric,
    buffers: HashMap<String, SourceBuffer>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl KnnDetector {
    pub fn new() -> Self {
        Self {
            config: DetectorConfig::default(),
            k: 5,
            metric: DistanceMetric::Euclidean,
            buffers: HashMap::new(),
            ready: false,
            trained_at: None,
        }
    }

    /// `k = clamp(sqrt(N), 3, configured_k)`, per the dynamic-k rule.
    fn dynamic_k(&self, n: usize) -> usize {
        let sqrt_n = (n as f64).sqrt().round() as usize;
        sqrt_n.clamp(3, self.k.max(3))
    }
}

impl Default for KnnDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for KnnDetector {
    fn configure(&mut self, config: DetectorConfig) -> Result<()> {
        if let Some(k) = config.extra.get("k").and_then(|v| v.as_u64()) {
            self.k = k as usize;
        }
        if let Some(metric) = config.extra.get("distanceMetric").and_then(|v| v.as_str()) {
            self.metric = match metric {
                "manhattan" => DistanceMetric::Manhattan,
                "cosine" => DistanceMetric::Cosine,
                _ => DistanceMetric::Euclidean,
            };
        }
        self.config = config;
        Ok(())
    }

    fn train(&mut self, historical: &[Sample]) -> Result<()> {
        if historical.len() < self.config.min_data_points {
            self.ready = false;
            return Err(CoreError::InsufficientData { have: historical.len(), need: self.config.min_data_points });
        }
        self.buffers.clear();
        for sample in historical {
            let buffer = self.buffers.entry(sample.source.clone()).or_insert_with(|| SourceBuffer {
                window: VecDeque::with_capacity(self.config.window_size),
                training_points: Vec::new(),
            });
            let features = feature_vector(&buffer.window, sample.value);
            buffer.training_points.push(features);
            buffer.window.push_back(sample.value);
            if buffer.window.len() > self.config.window_size {
                buffer.window.pop_front();
            }
        }
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
            let Some(buffer) = self.buffers.get_mut(&sample.source) else { continue };
            let features = feature_vector(&buffer.window, sample.value);

            if buffer.training_points.len() >= 3 {
                let k = self.dynamic_k(buffer.training_points.len());
                let distances: Vec<f64> =
                    buffer.training_points.iter().map(|p| distance(p, &features, self.metric)).collect();
                let nearest = k_smallest(distances, k);
                let avg_distance = nearest.iter().sum::<f64>() / nearest.len() as f64;

                let training_avg: f64 = {
                    let mut all = Vec::with_capacity(buffer.training_points.len());
                    for p in &buffer.training_points {
                        all.push(distance(p, &features, self.metric));
                    }
                    all.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    let sample_k = k.min(all.len());
                    all[..sample_k].iter().sum::<f64>() / sample_k as f64
                };
                let normalized = if training_avg > 1e-9 { avg_distance / training_avg } else { avg_distance };

                if normalized >= self.config.threshold {
                    // distance-weighted vote: closer neighbors contribute more
                    let weight_sum: f64 = nearest.iter().map(|d| 1.0 / (1.0 + d)).sum();
                    let confidence = (weight_sum / nearest.len() as f64 * self.config.sensitivity).clamp(0.0, 1.0);
                    let score = (normalized / (normalized + self.config.threshold)).clamp(0.0, 1.0);

                    let anomaly = Anomaly::new(
                        AnomalyType::Outlier,
                        score,
                        confidence,
                        sample.clone(),
                        format!("nearest-neighbor distance {avg_distance:.3} is {normalized:.2}x the training baseline"),
                        None,
                        avg_distance,
                        AnomalyContext {
                            metric: sample.metric.clone(),
                            labels: sample.labels.clone(),
                            algorithm: "knn".into(),
                            threshold: Some(self.config.threshold),
                            ..Default::default()
                        },
                    );
                    if let Some(anomaly) = apply_business_rules(anomaly, &self.config.business_rules) {
                        out.push(anomaly);
                    }
                }
            }

            buffer.training_points.push(features);
            buffer.window.push_back(sample.value);
            if buffer.window.len() > self.config.window_size {
                buffer.window.pop_front();
            }
        }
        out
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn reset(&mut self) {
        self.buffers.clear();
        self.ready = false;
        self.trained_at = None;
    }

    fn model_info(&self) -> ModelInfo {
        let mut parameters = HashMap::new();
        parameters.insert("k".into(), serde_json::json!(self.k));
        parameters.insert("metric".into(), serde_json::json!(self.metric));
        ModelInfo {
            algorithm: "knn".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: Some(self.buffers.values().map(|b| b.training_points.len()).sum()),
            parameters,
        }
    }

    fn name(&self) -> &str {
        "knn"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_flat(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new("s1", "latency", 100.0 + (i % 3) as f64, i as i64 * 1000)).collect()
    }

    #[test]
    fn train_with_too_few_points_fails() {
        let mut detector = KnnDetector::new();
        detector.configure(DetectorConfig { min_data_points: 30, ..Default::default() }).unwrap();
        assert!(detector.train(&train_flat(10)).is_err());
        assert!(!detector.is_ready());
    }

    #[test]
    fn far_outlier_is_flagged_as_outlier() {
        let mut detector = KnnDetector::new();
        detector.configure(DetectorConfig { min_data_points: 20, threshold: 3.0, ..Default::default() }).unwrap();
        detector.train(&train_flat(40)).unwrap();
        let ctx = DetectionContext::default();
        let outlier = Sample::new("s1", "latency", 5000.0, 41_000);
        let anomalies = detector.detect(&[outlier], &ctx);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyType::Outlier);
    }

    #[test]
    fn dynamic_k_is_clamped_between_three_and_configured() {
        let mut detector = KnnDetector::new();
        detector.k = 50;
        assert_eq!(detector.dynamic_k(4), 3);
        assert_eq!(detector.dynamic_k(10_000), 50);
    }
}
