//! Threshold detector: static upper/lower/warning bounds plus an optional
//! adaptive mode that recomputes effective thresholds from a rolling
//! per-source buffer. Grounded on `resource_manager.rs`'s scale-up/down
//! threshold comparisons against fleet averages, generalized here to a
//! per-source value buffer instead of a fleet-wide CPU average.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, AnomalyType, DetectionContext, ModelInfo, Sample};

use super::{apply_business_rules, Detector, DetectorConfig, HasBaseline};

/// Static thresholds plus rate-of-change bounds, per source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateThresholds {
    pub max_increase: f64,
    pub max_decrease: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub upper: f64,
    pub lower: f64,
    pub upper_warning: f64,
    pub lower_warning: f64,
    pub rate: RateThresholds,
    pub dynamic: bool,
    pub last_updated: i64,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            upper: f64::INFINITY,
            lower: f64::NEG_INFINITY,
            upper_warning: f64::INFINITY,
            lower_warning: f64::NEG_INFINITY,
            rate: RateThresholds { max_increase: f64::INFINITY, max_decrease: f64::INFINITY },
            dynamic: false,
            last_updated: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdaptiveThreshold {
    pub mean: f64,
    pub std_dev: f64,
    pub volatility: f64,
    pub confidence: f64,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    UpperCritical,
    UpperWarning,
    LowerCritical,
    LowerWarning,
    RateIncrease,
    RateDecrease,
}

struct SourceState {
    thresholds: ThresholdSet,
    adaptive: Option<AdaptiveThreshold>,
    adaptive_enabled: bool,
    buffer: VecDeque<f64>,
    last_value: Option<f64>,
}

impl SourceState {
    fn new(thresholds: ThresholdSet) -> Self {
        Self {
            thresholds,
            adaptive: None,
            adaptive_enabled: thresholds.dynamic,
            buffer: VecDeque::new(),
            last_value: None,
        }
    }
}

pub struct ThresholdDetector {
    config: DetectorConfig,
    sources: HashMap<String, SourceState>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ThresholdDetector {
    pub fn new() -> Self {
        Self { config: DetectorConfig::default(), sources: HashMap::new(), ready: false, trained_at: None }
    }

    /// Adaptive factor per the spec: 1.3x high volatility, 0.8x low
    /// volatility, 1.5x recent deployment, 2.0x in maintenance, clamped to
    /// [0.5, 3.0].
    fn adaptive_factor(volatility: f64, recent_deployment: bool, in_maintenance: bool) -> f64 {
        let mut factor = 1.0;
        if volatility > 0.2 {
            factor *= 1.3;
        } else if volatility < 0.05 {
            factor *= 0.8;
        }
        if recent_deployment {
            factor *= 1.5;
        }
        if in_maintenance {
            factor *= 2.0;
        }
        factor.clamp(0.5, 3.0)
    }

    fn effective_thresholds(
        &self,
        base: &ThresholdSet,
        adaptive: Option<&AdaptiveThreshold>,
        ctx: &DetectionContext,
        timestamp: i64,
    ) -> ThresholdSet {
        let Some(adaptive) = adaptive.filter(|_| base.dynamic) else {
            return *base;
        };
        let k = self.config.threshold;
        let factor = Self::adaptive_factor(
            adaptive.volatility,
            ctx.recent_deployment(timestamp, 15 * 60 * 1000),
            ctx.is_in_maintenance(timestamp),
        );
        let spread = k * factor * adaptive.std_dev;
        ThresholdSet {
            upper: adaptive.mean + spread,
            lower: adaptive.mean - spread,
            upper_warning: adaptive.mean + 0.7 * spread,
            lower_warning: adaptive.mean - 0.7 * spread,
            rate: base.rate,
            dynamic: true,
            last_updated: timestamp,
        }
    }

    fn classify_violation(value: f64, effective: &ThresholdSet, prev: Option<f64>) -> Option<(ViolationKind, AnomalyType, f64)> {
        if value > effective.upper {
            return Some((ViolationKind::UpperCritical, AnomalyType::Spike, value - effective.upper));
        }
        if value < effective.lower {
            return Some((ViolationKind::LowerCritical, AnomalyType::Drop, effective.lower - value));
        }
        if let Some(prev) = prev {
            let delta = value - prev;
            if delta > effective.rate.max_increase {
                return Some((ViolationKind::RateIncrease, AnomalyType::Spike, delta - effective.rate.max_increase));
            }
            if -delta > effective.rate.max_decrease {
                return Some((ViolationKind::RateDecrease, AnomalyType::Drop, -delta - effective.rate.max_decrease));
            }
        }
        if value > effective.upper_warning {
            return Some((ViolationKind::UpperWarning, AnomalyType::ThresholdBreach, value - effective.upper_warning));
        }
        if value < effective.lower_warning {
            return Some((ViolationKind::LowerWarning, AnomalyType::ThresholdBreach, effective.lower_warning - value));
        }
        None
    }
}

impl Default for ThresholdDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for ThresholdDetector {
    fn configure(&mut self, config: DetectorConfig) -> Result<()> {
        self.config = config;
        Ok(())
    }

    fn train(&mut self, historical: &[Sample]) -> Result<()> {
        if historical.len() < self.config.min_data_points {
            self.ready = false;
            return Err(CoreError::InsufficientData { have: historical.len(), need: self.config.min_data_points });
        }
        let mut by_source: HashMap<String, Vec<f64>> = HashMap::new();
        for sample in historical {
            by_source.entry(sample.source.clone()).or_default().push(sample.value);
        }
        self.sources.clear();
        let k = self.config.threshold;
        for (source, values) in by_source {
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std_dev = variance.sqrt();

            let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
            let positive: Vec<f64> = deltas.iter().copied().filter(|d| *d > 0.0).collect();
            let negative: Vec<f64> = deltas.iter().copied().filter(|d| *d < 0.0).map(f64::abs).collect();
            let rate_stats = |xs: &[f64]| -> (f64, f64) {
                if xs.is_empty() {
                    return (0.0, 0.0);
                }
                let m = xs.iter().sum::<f64>() / xs.len() as f64;
                let v = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64;
                (m, v.sqrt())
            };
            let (pos_mean, pos_std) = rate_stats(&positive);
            let (neg_mean, neg_std) = rate_stats(&negative);

            let mut state = SourceState::new(ThresholdSet {
                upper: mean + k * std_dev,
                lower: mean - k * std_dev,
                upper_warning: mean + 0.7 * k * std_dev,
                lower_warning: mean - 0.7 * k * std_dev,
                rate: RateThresholds {
                    max_increase: pos_mean + 2.0 * pos_std,
                    max_decrease: neg_mean + 2.0 * neg_std,
                },
                dynamic: self.config.extra.get("adaptiveThresholds").and_then(|v| v.as_bool()).unwrap_or(false),
                last_updated: 0,
            });
            state.adaptive = Some(AdaptiveThreshold {
                mean,
                std_dev,
                volatility: if mean.abs() > f64::EPSILON { std_dev / mean.abs() } else { 0.0 },
                confidence: (n / self.config.min_data_points as f64).min(1.0),
                last_updated: 0,
            });
            state.buffer = values.into_iter().collect();
            while state.buffer.len() > self.config.window_size {
                state.buffer.pop_front();
            }
            self.sources.insert(source, state);
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
            let state = self
                .sources
                .entry(sample.source.clone())
                .or_insert_with(|| SourceState::new(ThresholdSet::default()));

            let effective = self.effective_thresholds(&state.thresholds, state.adaptive.as_ref(), ctx, sample.timestamp);
            let violation = Self::classify_violation(sample.value, &effective, state.last_value);

            state.buffer.push_back(sample.value);
            while state.buffer.len() > window_size {
                state.buffer.pop_front();
            }
            state.last_value = Some(sample.value);

            let Some((kind, anomaly_type, deviation)) = violation else {
                continue;
            };
            let expected = match kind {
                ViolationKind::UpperCritical | ViolationKind::UpperWarning => Some(effective.upper),
                ViolationKind::LowerCritical | ViolationKind::LowerWarning => Some(effective.lower),
                _ => state.last_value,
            };
            let score = match kind {
                ViolationKind::UpperCritical | ViolationKind::LowerCritical => 1.0,
                _ => 0.6,
            };
            let confidence = (0.5 + 0.5 * self.config.sensitivity).clamp(0.0, 1.0);

            let anomaly = Anomaly::new(
                anomaly_type,
                score,
                confidence,
                sample.clone(),
                format!("threshold violation {kind:?} on metric {}", sample.metric),
                expected,
                deviation,
                AnomalyContext {
                    metric: sample.metric.clone(),
                    labels: sample.labels.clone(),
                    window_size: Some(window_size),
                    algorithm: "threshold".into(),
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
        self.sources.clear();
        self.ready = false;
        self.trained_at = None;
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            algorithm: "threshold".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: Some(self.sources.values().map(|s| s.buffer.len()).sum()),
            parameters: HashMap::new(),
        }
    }

    fn name(&self) -> &str {
        "threshold"
    }
}

impl ThresholdDetector {
    pub fn get_thresholds(&self, source: &str) -> Option<ThresholdSet> {
        self.sources.get(source).map(|s| s.thresholds)
    }

    pub fn set_threshold(&mut self, source: &str, thresholds: ThresholdSet) {
        self.sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(thresholds))
            .thresholds = thresholds;
    }

    pub fn get_adaptive_thresholds(&self, source: &str) -> Option<AdaptiveThreshold> {
        self.sources.get(source).and_then(|s| s.adaptive)
    }

    pub fn set_adaptive_enabled(&mut self, source: &str, enabled: bool) {
        if let Some(state) = self.sources.get_mut(source) {
            state.adaptive_enabled = enabled;
            state.thresholds.dynamic = enabled;
        }
    }
}

impl HasBaseline for ThresholdDetector {
    fn get_baseline(&self, source: &str) -> Option<crate::sample::Baseline> {
        self.sources.get(source).and_then(|s| s.adaptive).map(|a| crate::sample::Baseline {
            mean: a.mean,
            std_dev: a.std_dev,
            sample_size: self.sources.get(source).map(|s| s.buffer.len()).unwrap_or(0),
            last_updated: a.last_updated,
        })
    }

    fn set_baseline(&mut self, source: &str, baseline: crate::sample::Baseline) {
        let state = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceState::new(ThresholdSet::default()));
        state.adaptive = Some(AdaptiveThreshold {
            mean: baseline.mean,
            std_dev: baseline.std_dev,
            volatility: if baseline.mean.abs() > f64::EPSILON { baseline.std_dev / baseline.mean.abs() } else { 0.0 },
            confidence: 1.0,
            last_updated: baseline.last_updated,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_flat(detector: &mut ThresholdDetector, upper: f64) {
        let historical: Vec<Sample> = (0..50).map(|i| Sample::new("s1", "cpu", 50.0, 1000 * i as i64)).collect();
        detector.configure(DetectorConfig { threshold: 3.0, min_data_points: 30, ..Default::default() }).unwrap();
        detector.train(&historical).unwrap();
        detector.set_threshold("s1", ThresholdSet { upper, lower: -upper, upper_warning: upper * 0.7, lower_warning: -upper * 0.7, rate: RateThresholds { max_increase: f64::INFINITY, max_decrease: f64::INFINITY }, dynamic: false, last_updated: 0 });
    }

    #[test]
    fn s4_upper_violation_is_exactly_one_critical() {
        let mut detector = ThresholdDetector::new();
        train_flat(&mut detector, 100.0);
        let ctx = DetectionContext::default();
        let over = Sample::new("s1", "cpu", 500.0, 2000);
        let anomalies = detector.detect(&[over], &ctx);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyType::Spike);
    }

    #[test]
    fn s2_maintenance_window_suppresses_threshold_violation() {
        let mut detector = ThresholdDetector::new();
        train_flat(&mut detector, 100.0);
        let ctx = DetectionContext {
            maintenance_windows: vec![crate::sample::MaintenanceWindow { start: 100, end: 200 }],
            ..Default::default()
        };
        let sample = Sample::new("s1", "cpu", 500.0, 150);
        assert!(detector.detect(&[sample], &ctx).is_empty());
    }
}
