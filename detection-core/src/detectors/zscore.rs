//! Z-Score detector: a bounded rolling window per source with an online
//! baseline, firing when the standard or modified z-score crosses a
//! threshold. Grounded on `behavioral.rs`'s per-key sliding window (here a
//! value window instead of a request-timestamp window).

use std::collections::{HashMap, VecDeque};

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, AnomalyType, Baseline, DetectionContext, ModelInfo, Sample};

use super::{apply_business_rules, Detector, DetectorConfig, HasBaseline};

struct SourceWindow {
    values: VecDeque<f64>,
    baseline: Baseline,
}

impl SourceWindow {
    fn new() -> Self {
        Self {
            values: VecDeque::new(),
            baseline: Baseline::default(),
        }
    }

    fn push(&mut self, value: f64, timestamp: i64, window_size: usize) {
        self.values.push_back(value);
        while self.values.len() > window_size {
            self.values.pop_front();
        }
        self.recompute(timestamp);
    }

    fn recompute(&mut self, timestamp: i64) {
        let n = self.values.len();
        if n == 0 {
            self.baseline = Baseline::default();
            return;
        }
        let mean = self.values.iter().sum::<f64>() / n as f64;
        let variance = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        self.baseline = Baseline {
            mean,
            std_dev: variance.sqrt(),
            sample_size: n,
            last_updated: timestamp,
        };
    }

    fn median_and_mad(&self) -> (f64, f64) {
        let mut sorted: Vec<f64> = self.values.iter().cloned().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = percentile(&sorted, 0.5);
        let deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
        let mut dev_sorted = deviations;
        dev_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mad = percentile(&dev_sorted, 0.5);
        (median, mad)
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub struct ZScoreDetector {
    config: DetectorConfig,
    windows: HashMap<String, SourceWindow>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ZScoreDetector {
    pub fn new() -> Self {
        Self {
            config: DetectorConfig::default(),
            windows: HashMap::new(),
            ready: false,
            trained_at: None,
        }
    }

    fn classify(value: f64, baseline: &Baseline) -> AnomalyType {
        if value > baseline.mean + 3.0 * baseline.std_dev {
            AnomalyType::Spike
        } else if value < baseline.mean - 3.0 * baseline.std_dev {
            AnomalyType::Drop
        } else {
            AnomalyType::Outlier
        }
    }

    fn confidence(z: f64, modified_z: f64, window_fullness: f64, deployment_penalty: f64) -> f64 {
        let magnitude = (z / (z + 3.0)).clamp(0.0, 1.0);
        let agreement = 1.0 - ((z - modified_z).abs() / (z.max(modified_z).max(1.0))).min(1.0);
        let raw = 0.5 * magnitude + 0.3 * agreement + 0.2 * window_fullness;
        (raw * deployment_penalty).clamp(0.0, 1.0)
    }
}

impl Default for ZScoreDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for ZScoreDetector {
    fn configure(&mut self, config: DetectorConfig) -> Result<()> {
        self.config = config;
        Ok(())
    }

    fn train(&mut self, historical: &[Sample]) -> Result<()> {
        if historical.len() < self.config.min_data_points {
            self.ready = false;
            return Err(CoreError::InsufficientData {
                have: historical.len(),
                need: self.config.min_data_points,
            });
        }
        self.windows.clear();
        for sample in historical {
            let window = self
                .windows
                .entry(sample.source.clone())
                .or_insert_with(SourceWindow::new);
            window.push(sample.value, sample.timestamp, self.config.window_size);
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
            let window_size = self.config.window_size;
            let window = self
                .windows
                .entry(sample.source.clone())
                .or_insert_with(SourceWindow::new);

            let baseline_before = window.baseline;
            let fullness = (window.values.len() as f64 / window_size as f64).min(1.0);

            let z = if baseline_before.std_dev > 0.0 {
                (sample.value - baseline_before.mean).abs() / baseline_before.std_dev
            } else {
                0.0
            };
            let (median, mad) = window.median_and_mad();
            let modified_z = if mad > 0.0 {
                0.6745 * (sample.value - median).abs() / mad
            } else {
                0.0
            };

            window.push(sample.value, sample.timestamp, window_size);

            if z < self.config.threshold || baseline_before.sample_size == 0 {
                continue;
            }

            let deployment_penalty = if ctx.recent_deployment(sample.timestamp, 15 * 60 * 1000) {
                0.7
            } else {
                1.0
            };
            let confidence = Self::confidence(z, modified_z, fullness, deployment_penalty)
                * (0.5 + 0.5 * self.config.sensitivity);
            let kind = Self::classify(sample.value, &baseline_before);

            let anomaly = Anomaly::new(
                kind,
                (z / (z + self.config.threshold)).clamp(0.0, 1.0),
                confidence.clamp(0.0, 1.0),
                sample.clone(),
                format!(
                    "z-score {:.2} exceeds threshold {:.2} for metric {}",
                    z, self.config.threshold, sample.metric
                ),
                Some(baseline_before.mean),
                (sample.value - baseline_before.mean).abs(),
                AnomalyContext {
                    metric: sample.metric.clone(),
                    labels: sample.labels.clone(),
                    window_size: Some(window_size),
                    algorithm: "zscore".into(),
                    threshold: Some(self.config.threshold),
                    historical_mean: Some(baseline_before.mean),
                    historical_std_dev: Some(baseline_before.std_dev),
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
        self.windows.clear();
        self.ready = false;
        self.trained_at = None;
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            algorithm: "zscore".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: Some(self.windows.values().map(|w| w.values.len()).sum()),
            parameters: HashMap::new(),
        }
    }

    fn name(&self) -> &str {
        "zscore"
    }
}

impl HasBaseline for ZScoreDetector {
    fn get_baseline(&self, source: &str) -> Option<Baseline> {
        self.windows.get(source).map(|w| w.baseline)
    }

    fn set_baseline(&mut self, source: &str, baseline: Baseline) {
        let window = self
            .windows
            .entry(source.to_string())
            .or_insert_with(SourceWindow::new);
        window.baseline = baseline;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand_chacha::rand_core::SeedableRng;

    fn train_normal(detector: &mut ZScoreDetector, n: usize, mean: f64) {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let historical: Vec<Sample> = (0..n)
            .map(|i| {
                let noise: f64 = rng.gen_range(-1.0..1.0);
                Sample::new("s1", "latency", mean + noise, 1_700_000_000_000 - (n - i) as i64 * 1000)
            })
            .collect();
        detector.train(&historical).unwrap();
    }

    #[test]
    fn s1_spike_is_detected() {
        let mut detector = ZScoreDetector::new();
        detector
            .configure(DetectorConfig {
                threshold: 3.0,
                window_size: 100,
                min_data_points: 30,
                ..Default::default()
            })
            .unwrap();
        train_normal(&mut detector, 100, 50.0);
        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "latency", 70.0, 1_700_000_000_000);
        let anomalies = detector.detect(&[spike], &ctx);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyType::Spike);
        assert!(anomalies[0].expected_value.unwrap() > 45.0 && anomalies[0].expected_value.unwrap() < 55.0);
    }

    #[test]
    fn train_with_too_few_points_fails_and_stays_not_ready() {
        let mut detector = ZScoreDetector::new();
        detector.configure(DetectorConfig { min_data_points: 30, ..Default::default() }).unwrap();
        let few: Vec<Sample> = (0..5).map(|i| Sample::new("s", "m", i as f64, i)).collect();
        assert!(detector.train(&few).is_err());
        assert!(!detector.is_ready());
    }

    #[test]
    fn maintenance_window_suppresses_all_anomalies() {
        let mut detector = ZScoreDetector::new();
        detector.configure(DetectorConfig::default()).unwrap();
        train_normal(&mut detector, 100, 50.0);
        let ctx = DetectionContext {
            maintenance_windows: vec![crate::sample::MaintenanceWindow { start: 0, end: 2_000_000_000_000 }],
            ..Default::default()
        };
        let spike = Sample::new("s1", "latency", 999.0, 1_700_000_000_000);
        assert!(detector.detect(&[spike], &ctx).is_empty());
    }
}
