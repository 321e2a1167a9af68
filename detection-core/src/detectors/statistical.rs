//! Statistical ensemble detector: per-source descriptive statistics plus six
//! classical outlier methods (z-score, modified z-score, IQR, Grubbs,
//! Tukey, ESD) combined by fixed method weights. Grounded on
//! `behavioral.rs`'s per-key rolling statistics, generalized from counters
//! to a full descriptive-statistics vector.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, AnomalyType, DetectionContext, ModelInfo, Sample};

use super::{apply_business_rules, Detector, DetectorConfig, HasBaseline};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub mean: f64,
    pub median: f64,
    pub mode: f64,
    pub std_dev: f64,
    pub variance: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
    pub skewness: f64,
    pub kurtosis: f64,
    pub mad: f64,
    pub trimmed_mean: f64,
    pub cv: f64,
}

/// "Normality heuristic", not true Shapiro-Wilk — see design notes open
/// question: a tabulated Shapiro-Wilk routine is out of scope, so this
/// method is named and documented as an approximation rather than claiming
/// Shapiro-Wilk semantics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DistributionAnalysis {
    pub is_normal: bool,
    pub normality_heuristic_score: f64,
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn compute_statistics(values: &[f64]) -> Statistics {
    if values.is_empty() {
        return Statistics::default();
    }
    let n = values.len() as f64;
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    let median = percentile(&sorted, 0.5);
    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];

    let deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
    let mut dev_sorted = deviations;
    dev_sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mad = percentile(&dev_sorted, 0.5);

    let skewness = if std_dev > 0.0 {
        values.iter().map(|v| ((v - mean) / std_dev).powi(3)).sum::<f64>() / n
    } else {
        0.0
    };
    let kurtosis = if std_dev > 0.0 {
        values.iter().map(|v| ((v - mean) / std_dev).powi(4)).sum::<f64>() / n - 3.0
    } else {
        0.0
    };

    let trim_count = ((n * 0.10) as usize).min(sorted.len() / 2);
    let trimmed: &[f64] = &sorted[trim_count..sorted.len() - trim_count.min(sorted.len())];
    let trimmed_mean = if trimmed.is_empty() {
        mean
    } else {
        trimmed.iter().sum::<f64>() / trimmed.len() as f64
    };

    // Mode via coarse binning; continuous signals rarely repeat exactly.
    let mode = mode_via_binning(&sorted);

    Statistics {
        mean,
        median,
        mode,
        std_dev,
        variance,
        q1,
        q3,
        iqr: q3 - q1,
        min,
        max,
        range: max - min,
        skewness,
        kurtosis,
        mad,
        trimmed_mean,
        cv: if mean != 0.0 { std_dev / mean.abs() } else { 0.0 },
    }
}

fn mode_via_binning(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    if (max - min).abs() < f64::EPSILON {
        return min;
    }
    let bins = 20usize;
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for &v in sorted {
        let idx = (((v - min) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let (best_bin, _) = counts.iter().enumerate().max_by_key(|(_, c)| **c).unwrap();
    min + (best_bin as f64 + 0.5) * width
}

fn analyze_distribution(stats: &Statistics) -> DistributionAnalysis {
    let score = 1.0 - (stats.skewness.abs() / 2.0 + stats.kurtosis.abs() / 7.0).min(1.0);
    DistributionAnalysis { is_normal: score > 0.9, normality_heuristic_score: score }
}

#[derive(Debug, Clone, Copy)]
struct MethodResult {
    is_anomaly: bool,
    score: f64,
    confidence: f64,
    anomaly_type: AnomalyType,
}

const METHOD_WEIGHTS: [(&str, f64); 6] =
    [("zscore", 1.0), ("modified_zscore", 1.2), ("iqr", 0.8), ("grubbs", 1.1), ("tukey", 0.9), ("esd", 1.3)];

fn method_zscore(value: f64, stats: &Statistics, threshold: f64) -> MethodResult {
    let z = if stats.std_dev > 0.0 { (value - stats.mean).abs() / stats.std_dev } else { 0.0 };
    MethodResult {
        is_anomaly: z >= threshold,
        score: (z / (z + threshold)).clamp(0.0, 1.0),
        confidence: (z / 6.0).clamp(0.0, 1.0),
        anomaly_type: if value > stats.mean { AnomalyType::Spike } else { AnomalyType::Drop },
    }
}

fn method_modified_zscore(value: f64, stats: &Statistics, threshold: f64) -> MethodResult {
    let mz = if stats.mad > 0.0 { 0.6745 * (value - stats.median).abs() / stats.mad } else { 0.0 };
    MethodResult {
        is_anomaly: mz >= threshold,
        score: (mz / (mz + threshold)).clamp(0.0, 1.0),
        confidence: (mz / 6.0).clamp(0.0, 1.0),
        anomaly_type: if value > stats.median { AnomalyType::Spike } else { AnomalyType::Drop },
    }
}

fn method_iqr(value: f64, stats: &Statistics) -> MethodResult {
    let lower = stats.q1 - 1.5 * stats.iqr;
    let upper = stats.q3 + 1.5 * stats.iqr;
    let is_anomaly = value < lower || value > upper;
    let deviation = if value > upper { value - upper } else { lower - value };
    MethodResult {
        is_anomaly,
        score: if stats.iqr > 0.0 { (deviation / stats.iqr).clamp(0.0, 1.0) } else { 0.0 },
        confidence: if is_anomaly { 0.7 } else { 0.0 },
        anomaly_type: if value > upper { AnomalyType::Outlier } else { AnomalyType::Drop },
    }
}

fn method_grubbs(value: f64, stats: &Statistics, n: usize) -> MethodResult {
    if stats.std_dev <= 0.0 || n < 3 {
        return MethodResult { is_anomaly: false, score: 0.0, confidence: 0.0, anomaly_type: AnomalyType::Outlier };
    }
    let g = (value - stats.mean).abs() / stats.std_dev;
    let nf = n as f64;
    // Two-sided critical value approximation via Student-t quantile surrogate.
    let t_crit = 1.96 + (nf.ln()).max(0.0) * 0.1;
    let g_crit = ((nf - 1.0) / nf.sqrt()) * (t_crit / (nf - 2.0 + t_crit.powi(2)).sqrt());
    MethodResult {
        is_anomaly: g > g_crit,
        score: (g / (g + g_crit.max(0.01))).clamp(0.0, 1.0),
        confidence: (g / (g_crit.max(0.01) * 2.0)).clamp(0.0, 1.0),
        anomaly_type: if value > stats.mean { AnomalyType::Spike } else { AnomalyType::Drop },
    }
}

fn method_tukey(value: f64, stats: &Statistics) -> MethodResult {
    const K: f64 = 2.2;
    let lower = stats.q1 - K * stats.iqr;
    let upper = stats.q3 + K * stats.iqr;
    let is_anomaly = value < lower || value > upper;
    MethodResult {
        is_anomaly,
        score: if stats.iqr > 0.0 {
            ((value - upper).max(lower - value) / stats.iqr).clamp(0.0, 1.0)
        } else {
            0.0
        },
        confidence: if is_anomaly { 0.65 } else { 0.0 },
        anomaly_type: if value > upper { AnomalyType::Spike } else { AnomalyType::Drop },
    }
}

fn method_esd(value: f64, stats: &Statistics, threshold: f64) -> MethodResult {
    // Generalized extreme studentized deviate, single-test form.
    let r = if stats.std_dev > 0.0 { (value - stats.mean).abs() / stats.std_dev } else { 0.0 };
    MethodResult {
        is_anomaly: r >= threshold,
        score: (r / (r + threshold)).clamp(0.0, 1.0),
        confidence: (r / 6.0).clamp(0.0, 1.0),
        anomaly_type: AnomalyType::Outlier,
    }
}

struct SourceWindow {
    values: VecDeque<f64>,
}

pub struct StatisticalDetector {
    config: DetectorConfig,
    windows: HashMap<String, SourceWindow>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StatisticalDetector {
    pub fn new() -> Self {
        Self { config: DetectorConfig::default(), windows: HashMap::new(), ready: false, trained_at: None }
    }

    pub fn statistics(&self, source: &str) -> Option<Statistics> {
        self.windows.get(source).map(|w| compute_statistics(&w.values.iter().copied().collect::<Vec<_>>()))
    }

    pub fn distribution(&self, source: &str) -> Option<DistributionAnalysis> {
        self.statistics(source).map(|s| analyze_distribution(&s))
    }
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StatisticalDetector {
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
            let window = self.windows.entry(sample.source.clone()).or_insert_with(|| SourceWindow { values: VecDeque::new() });
            window.values.push_back(sample.value);
            while window.values.len() > self.config.window_size {
                window.values.pop_front();
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
            let window_size = self.config.window_size;
            let threshold = self.config.threshold;
            let window = self.windows.entry(sample.source.clone()).or_insert_with(|| SourceWindow { values: VecDeque::new() });
            let values: Vec<f64> = window.values.iter().copied().collect();
            if values.is_empty() {
                window.values.push_back(sample.value);
                continue;
            }
            let stats = compute_statistics(&values);
            let n = values.len();

            let results = [
                ("zscore", method_zscore(sample.value, &stats, threshold)),
                ("modified_zscore", method_modified_zscore(sample.value, &stats, threshold)),
                ("iqr", method_iqr(sample.value, &stats)),
                ("grubbs", method_grubbs(sample.value, &stats, n)),
                ("tukey", method_tukey(sample.value, &stats)),
                ("esd", method_esd(sample.value, &stats, threshold)),
            ];

            window.values.push_back(sample.value);
            while window.values.len() > window_size {
                window.values.pop_front();
            }

            let anomalous: Vec<(&str, MethodResult)> =
                results.into_iter().filter(|(_, r)| r.is_anomaly).collect();
            if anomalous.is_empty() {
                continue;
            }

            let weight_of = |name: &str| METHOD_WEIGHTS.iter().find(|(n, _)| *n == name).map(|(_, w)| *w).unwrap_or(1.0);
            let total_weight: f64 = anomalous.iter().map(|(name, _)| weight_of(name)).sum();
            let ensemble_score = anomalous.iter().map(|(name, r)| r.score * weight_of(name)).sum::<f64>() / total_weight;
            let ensemble_confidence =
                anomalous.iter().map(|(name, r)| r.confidence * weight_of(name)).sum::<f64>() / total_weight;

            let mut type_votes: HashMap<AnomalyType, f64> = HashMap::new();
            for (name, r) in &anomalous {
                *type_votes.entry(r.anomaly_type).or_insert(0.0) += weight_of(name);
            }
            let kind = type_votes
                .into_iter()
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
                .map(|(t, _)| t)
                .unwrap_or(AnomalyType::Outlier);

            let confidence = (ensemble_confidence * (0.5 + 0.5 * self.config.sensitivity)).clamp(0.0, 1.0);
            let methods: Vec<&str> = anomalous.iter().map(|(n, _)| *n).collect();

            let anomaly = Anomaly::new(
                kind,
                ensemble_score.clamp(0.0, 1.0),
                confidence,
                sample.clone(),
                format!("statistical ensemble flagged by {} of 6 methods: {}", anomalous.len(), methods.join(",")),
                Some(stats.mean),
                (sample.value - stats.mean).abs(),
                AnomalyContext {
                    metric: sample.metric.clone(),
                    labels: sample.labels.clone(),
                    window_size: Some(window_size),
                    algorithm: "statistical_ensemble".into(),
                    threshold: Some(threshold),
                    historical_mean: Some(stats.mean),
                    historical_std_dev: Some(stats.std_dev),
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
            algorithm: "statistical_ensemble".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: Some(self.windows.values().map(|w| w.values.len()).sum()),
            parameters: HashMap::new(),
        }
    }

    fn name(&self) -> &str {
        "statistical"
    }
}

impl HasBaseline for StatisticalDetector {
    fn get_baseline(&self, source: &str) -> Option<crate::sample::Baseline> {
        self.statistics(source).map(|s| crate::sample::Baseline {
            mean: s.mean,
            std_dev: s.std_dev,
            sample_size: self.windows.get(source).map(|w| w.values.len()).unwrap_or(0),
            last_updated: 0,
        })
    }

    fn set_baseline(&mut self, source: &str, baseline: crate::sample::Baseline) {
        let window = self.windows.entry(source.to_string()).or_insert_with(|| SourceWindow { values: VecDeque::new() });
        window.values = std::iter::repeat(baseline.mean).take(baseline.sample_size.max(1)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensemble_flags_extreme_spike() {
        let mut detector = StatisticalDetector::new();
        detector.configure(DetectorConfig { threshold: 3.0, window_size: 100, min_data_points: 20, ..Default::default() }).unwrap();
        let historical: Vec<Sample> =
            (0..50).map(|i| Sample::new("s1", "latency", 50.0 + (i % 3) as f64 * 0.1, i as i64 * 1000)).collect();
        detector.train(&historical).unwrap();
        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "latency", 500.0, 60_000);
        let anomalies = detector.detect(&[spike], &ctx);
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].score > 0.0 && anomalies[0].score <= 1.0);
    }

    #[test]
    fn train_with_too_few_points_fails() {
        let mut detector = StatisticalDetector::new();
        detector.configure(DetectorConfig { min_data_points: 30, ..Default::default() }).unwrap();
        let few: Vec<Sample> = (0..5).map(|i| Sample::new("s", "m", i as f64, i)).collect();
        assert!(detector.train(&few).is_err());
        assert!(!detector.is_ready());
    }
}
