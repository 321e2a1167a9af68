//! Composite meta-detector: owns child detectors, fans detection out to them
//! concurrently, and combines their verdicts with a chosen ensemble
//! strategy. Concurrent child fan-out joined back in deterministic
//! (name-sorted) order is grounded on how `anomaly_ml.rs`'s async ML engine
//! dispatches inference off the hot path. Per-child response times and a
//! hand-maintained performance record feed the `adaptive_weighted` and
//! `hierarchical` strategies below, mirroring `resource_manager.rs`'s habit
//! of keeping a rolling per-node record to drive later decisions.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::sample::{Anomaly, AnomalyContext, DetectionContext, ModelInfo, PerformanceRequirements, Sample};

use super::{apply_business_rules, Detector, DetectorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStrategy {
    MajorityVote,
    WeightedAverage,
    AdaptiveWeighted,
    Stacking,
    Hierarchical,
}

impl Default for EnsembleStrategy {
    fn default() -> Self {
        EnsembleStrategy::WeightedAverage
    }
}

/// Named child detector with its fixed ensemble weight. The composite owns
/// its children outright; nothing else may reach into them, per the acyclic
/// ownership design note.
pub struct ChildDetector {
    pub name: String,
    pub weight: f64,
    pub detector: Box<dyn Detector>,
}

/// Picks the subset of children relevant to the current detection context
/// (e.g. skip low-latency-sensitive children during a `low_latency`
/// requirement), mirroring the context-aware dispatch the spec calls for.
pub struct ContextAnalyzer;

impl ContextAnalyzer {
    fn is_relevant(name: &str, requirements: &PerformanceRequirements) -> bool {
        !(requirements.low_latency && (name == "isolation_forest" || name == "ml_ensemble"))
    }

    pub fn relevant_children<'a>(children: &'a [ChildDetector], requirements: &PerformanceRequirements) -> Vec<&'a ChildDetector> {
        children.iter().filter(|c| Self::is_relevant(&c.name, requirements)).collect()
    }
}

/// Fast, cheap screening detectors for the `hierarchical` strategy's stage
/// one. Everything else registered on the composite is "sophisticated" and
/// only runs once stage one's score clears the screen threshold.
const FAST_DETECTOR_NAMES: [&str; 2] = ["zscore", "threshold"];

/// Stage-1 early-exit threshold below which stage-2 detectors are never
/// invoked for a sample, per spec §4.2.8's hierarchical strategy.
const HIERARCHICAL_SCREEN_THRESHOLD: f64 = 0.3;

/// Detector is considered "slow" under a low-latency context once its
/// rolling average response time passes this. Classical statistical/
/// threshold checks run in low-single-digit microseconds; anything
/// consistently costing whole milliseconds is relatively expensive.
const SLOW_RESPONSE_MS: f64 = 1.0;

const RECENT_DEPLOYMENT_WINDOW_MS: i64 = 15 * 60 * 1000;

/// Per-child bookkeeping for `adaptive_weighted` and the stacking
/// meta-features. `accuracy`/`precision`/`recall`/`f1`/`fpr` start at the
/// optimistic default (no evidence against the detector yet) and are meant
/// to be recalibrated externally as ground truth becomes available;
/// `avg_response_time_ms` and `detection_count` are measured directly from
/// `detect()` calls.
#[derive(Debug, Clone, Copy)]
struct ChildPerformance {
    accuracy: f64,
    precision: f64,
    recall: f64,
    f1: f64,
    fpr: f64,
    avg_response_time_ms: f64,
    detection_count: u64,
}

impl Default for ChildPerformance {
    fn default() -> Self {
        Self { accuracy: 1.0, precision: 1.0, recall: 1.0, f1: 1.0, fpr: 0.0, avg_response_time_ms: 0.0, detection_count: 0 }
    }
}

/// One child's verdict on a batch plus how long it took to produce it.
struct ChildResult {
    name: String,
    weight: f64,
    anomalies: Vec<Anomaly>,
    response_time_ms: f64,
}

pub struct CompositeDetector {
    config: DetectorConfig,
    children: Vec<ChildDetector>,
    strategy: EnsembleStrategy,
    performance: HashMap<String, ChildPerformance>,
    ready: bool,
    trained_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CompositeDetector {
    pub fn new(strategy: EnsembleStrategy) -> Self {
        Self {
            config: DetectorConfig::default(),
            children: Vec::new(),
            strategy,
            performance: HashMap::new(),
            ready: false,
            trained_at: None,
        }
    }

    pub fn add_child(&mut self, name: impl Into<String>, weight: f64, detector: Box<dyn Detector>) {
        self.children.push(ChildDetector { name: name.into(), weight, detector });
    }

    /// Runs the named children's `detect` on their own scoped threads so the
    /// composite's wall-clock cost is the slowest child among them, not the
    /// sum, then joins and sorts by name so downstream ensemble weighting is
    /// reproducible regardless of which thread finished first. Children not
    /// named in `names` are not touched at all — this is what lets
    /// `detect_hierarchical` skip invoking stage-2 detectors entirely.
    fn run_named_children(&mut self, names: &[String], samples: &[Sample], ctx: &DetectionContext) -> Vec<ChildResult> {
        let selected: Vec<&mut ChildDetector> = self.children.iter_mut().filter(|c| names.iter().any(|n| n == &c.name)).collect();
        let mut results: Vec<ChildResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = selected
                .into_iter()
                .map(|child| {
                    let name = child.name.clone();
                    let weight = child.weight;
                    let detector = &mut child.detector;
                    let handle = scope.spawn(move || {
                        let start = Instant::now();
                        let anomalies = if detector.is_ready() { detector.detect(samples, ctx) } else { Vec::new() };
                        (anomalies, start.elapsed().as_secs_f64() * 1000.0)
                    });
                    (name, weight, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, weight, handle)| {
                    let (anomalies, response_time_ms) = handle.join().unwrap_or_else(|_| {
                        tracing::warn!(detector = %name, "child detector panicked; contributing zero to ensemble");
                        (Vec::new(), 0.0)
                    });
                    ChildResult { name, weight, anomalies, response_time_ms }
                })
                .collect()
        });
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    fn sorted_candidates(&mut self, samples: &[Sample], ctx: &DetectionContext) -> Vec<ChildResult> {
        let names: Vec<String> =
            ContextAnalyzer::relevant_children(&self.children, &ctx.performance_requirements).iter().map(|c| c.name.clone()).collect();
        let results = self.run_named_children(&names, samples, ctx);
        self.record_performance(&results);
        results
    }

    /// Updates the rolling response-time EWMA and detection count per
    /// child. Children never invoked in a round (e.g. stage-2 detectors
    /// skipped by the hierarchical screen) simply don't appear in `results`
    /// and keep whatever record they already had.
    fn record_performance(&mut self, results: &[ChildResult]) {
        for r in results {
            let perf = self.performance.entry(r.name.clone()).or_insert_with(ChildPerformance::default);
            perf.avg_response_time_ms = if perf.detection_count == 0 && perf.avg_response_time_ms == 0.0 {
                r.response_time_ms
            } else {
                perf.avg_response_time_ms * 0.8 + r.response_time_ms * 0.2
            };
            perf.detection_count += r.anomalies.len() as u64;
        }
    }

    /// `weight *= (accuracy+f1)/2`, then the three contextual multipliers
    /// from spec §4.2.8: slow-under-low-latency, recent-deployment boost for
    /// threshold/statistical, and a maintenance dampener (defensive — the
    /// top-level `detect` loop already skips samples inside a maintenance
    /// window before this is ever reached).
    fn adaptive_weight(&self, name: &str, base_weight: f64, ctx: &DetectionContext, timestamp: i64) -> f64 {
        let perf = self.performance.get(name).copied().unwrap_or_default();
        let mut weight = base_weight * ((perf.accuracy + perf.f1) / 2.0);
        if ctx.performance_requirements.low_latency && perf.avg_response_time_ms > SLOW_RESPONSE_MS {
            weight *= 0.8;
        }
        if matches!(name, "threshold" | "statistical") && ctx.recent_deployment(timestamp, RECENT_DEPLOYMENT_WINDOW_MS) {
            weight *= 1.2;
        }
        if ctx.is_in_maintenance(timestamp) {
            weight *= 0.7;
        }
        weight.max(0.0)
    }

    /// Extracts the spec's 12 stacking meta-features and applies the
    /// heuristic meta-predictor, returning `None` when the gate
    /// (`metaScore > 0.6 && meanConf > 0.5`) fails.
    fn stacking_meta_score(
        &self,
        voting: &[&(String, f64, Option<&Anomaly>)],
        ctx: &DetectionContext,
        timestamp: i64,
    ) -> Option<(f64, f64)> {
        let scores: Vec<f64> = voting.iter().map(|(_, _, a)| a.unwrap().score).collect();
        let confidences: Vec<f64> = voting.iter().map(|(_, _, a)| a.unwrap().confidence).collect();
        let n = scores.len() as f64;
        if n == 0.0 {
            return None;
        }

        // meta-features 1-4: mean/max/min/rms score
        let mean_score = scores.iter().sum::<f64>() / n;
        let max_score = scores.iter().cloned().fold(f64::MIN, f64::max);
        let min_score = scores.iter().cloned().fold(f64::MAX, f64::min);
        let rms_score = (scores.iter().map(|s| s * s).sum::<f64>() / n).sqrt();
        // meta-features 5-6: mean/min confidence
        let mean_conf = confidences.iter().sum::<f64>() / n;
        let min_conf = confidences.iter().cloned().fold(f64::MAX, f64::min);
        // meta-features 7-9: counts per detector family
        let statistical_family = voting.iter().filter(|(name, _, _)| matches!(name.as_str(), "zscore" | "threshold" | "statistical")).count() as f64;
        let ml_family = voting.iter().filter(|(name, _, _)| matches!(name.as_str(), "isolation_forest" | "ml_ensemble" | "knn")).count() as f64;
        let seasonal_family = voting.iter().filter(|(name, _, _)| name == "seasonal").count() as f64;
        // meta-feature 10: max response time among voting children
        let max_response_time = voting
            .iter()
            .map(|(name, _, _)| self.performance.get(name).map(|p| p.avg_response_time_ms).unwrap_or(0.0))
            .fold(0.0_f64, f64::max);
        // meta-features 11-12: context flags
        let low_latency_flag = if ctx.performance_requirements.low_latency { 1.0 } else { 0.0 };
        let recent_deployment_flag = if ctx.recent_deployment(timestamp, RECENT_DEPLOYMENT_WINDOW_MS) { 1.0 } else { 0.0 };
        let _meta_features =
            [mean_score, max_score, min_score, rms_score, mean_conf, min_conf, statistical_family, ml_family, seasonal_family, max_response_time, low_latency_flag, recent_deployment_flag];

        let meta_score = 0.4 * mean_score + 0.4 * max_score + 0.2 * mean_conf;
        if meta_score > 0.6 && mean_conf > 0.5 {
            Some((meta_score.clamp(0.0, 1.0), mean_conf))
        } else {
            None
        }
    }

    fn combine(&self, sample: &Sample, ctx: &DetectionContext, per_child: &[(String, f64, Option<&Anomaly>)]) -> Option<Anomaly> {
        let voting: Vec<&(String, f64, Option<&Anomaly>)> = per_child.iter().filter(|(_, _, a)| a.is_some()).collect();
        if voting.is_empty() {
            return None;
        }

        let (score, confidence) = match self.strategy {
            EnsembleStrategy::MajorityVote => {
                let vote_ratio = voting.len() as f64 / per_child.len() as f64;
                if vote_ratio < 0.5 {
                    return None;
                }
                let avg_score = voting.iter().map(|(_, _, a)| a.unwrap().score).sum::<f64>() / voting.len() as f64;
                (avg_score, vote_ratio)
            }
            EnsembleStrategy::WeightedAverage => {
                let total_weight: f64 = per_child.iter().map(|(_, w, _)| w).sum();
                let weighted_score: f64 = voting.iter().map(|(_, w, a)| w * a.unwrap().score).sum::<f64>() / total_weight.max(1e-9);
                let weighted_confidence: f64 =
                    voting.iter().map(|(_, w, a)| w * a.unwrap().confidence).sum::<f64>() / total_weight.max(1e-9);
                (weighted_score, weighted_confidence)
            }
            EnsembleStrategy::AdaptiveWeighted => {
                let weights: Vec<f64> =
                    voting.iter().map(|(name, w, _)| self.adaptive_weight(name, *w, ctx, sample.timestamp)).collect();
                let total_adaptive: f64 = weights.iter().sum::<f64>().max(1e-9);
                let weighted_score: f64 =
                    voting.iter().zip(&weights).map(|((_, _, a), w)| w * a.unwrap().score).sum::<f64>() / total_adaptive;
                let weighted_confidence: f64 =
                    voting.iter().zip(&weights).map(|((_, _, a), w)| w * a.unwrap().confidence).sum::<f64>() / total_adaptive;
                (weighted_score, weighted_confidence)
            }
            EnsembleStrategy::Stacking => match self.stacking_meta_score(&voting, ctx, sample.timestamp) {
                Some(result) => result,
                None => return None,
            },
            EnsembleStrategy::Hierarchical => {
                // `detect()` special-cases this strategy in
                // `detect_hierarchical` before `combine` is ever reached;
                // this arm is a defensive fallback matching the old
                // first-name-sorted-winner behavior if it ever is.
                let first = voting[0].2.unwrap();
                return Some(Anomaly::new(
                    first.kind,
                    first.score,
                    first.confidence,
                    sample.clone(),
                    format!("composite(hierarchical): {} fired first", voting[0].0),
                    first.expected_value,
                    first.deviation,
                    AnomalyContext { algorithm: "composite".into(), metric: sample.metric.clone(), ..first.context.clone() },
                ));
            }
        };

        let kind = voting
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(_, _, a)| a.unwrap().kind)
            .unwrap_or(crate::sample::AnomalyType::Outlier);
        let names: Vec<String> = voting.iter().map(|(n, _, _)| n.clone()).collect();

        Some(Anomaly::new(
            kind,
            score.clamp(0.0, 1.0),
            confidence.clamp(0.0, 1.0),
            sample.clone(),
            format!("composite({:?}): agreement from [{}]", self.strategy, names.join(", ")),
            None,
            0.0,
            AnomalyContext { algorithm: "composite".into(), metric: sample.metric.clone(), labels: sample.labels.clone(), ..Default::default() },
        ))
    }

    /// Stage-1 screen with the fast detectors (threshold, z-score); samples
    /// whose screen score stays below `HIERARCHICAL_SCREEN_THRESHOLD` exit
    /// here and stage-2 is never invoked for them. When stage-2 detectors
    /// are invoked at all, they only run on the subset of samples that
    /// cleared the screen, per spec §4.2.8 and scenario S6.
    fn detect_hierarchical(&mut self, samples: &[Sample], ctx: &DetectionContext) -> Vec<Anomaly> {
        let relevant_names: Vec<String> =
            ContextAnalyzer::relevant_children(&self.children, &ctx.performance_requirements).iter().map(|c| c.name.clone()).collect();
        let fast_names: Vec<String> = relevant_names.iter().filter(|n| FAST_DETECTOR_NAMES.contains(&n.as_str())).cloned().collect();
        let sophisticated_names: Vec<String> =
            relevant_names.iter().filter(|n| !FAST_DETECTOR_NAMES.contains(&n.as_str())).cloned().collect();

        let fast_results = self.run_named_children(&fast_names, samples, ctx);
        self.record_performance(&fast_results);

        let fast_score_of = |timestamp: i64| -> f64 {
            fast_results
                .iter()
                .flat_map(|r| r.anomalies.iter())
                .filter(|a| a.timestamp == timestamp)
                .map(|a| a.score)
                .fold(0.0_f64, f64::max)
        };

        let needs_confirmation: Vec<Sample> = samples
            .iter()
            .filter(|s| !ctx.is_in_maintenance(s.timestamp) && fast_score_of(s.timestamp) >= HIERARCHICAL_SCREEN_THRESHOLD)
            .cloned()
            .collect();

        let sophisticated_results = if sophisticated_names.is_empty() || needs_confirmation.is_empty() {
            Vec::new()
        } else {
            let results = self.run_named_children(&sophisticated_names, &needs_confirmation, ctx);
            self.record_performance(&results);
            results
        };

        let mut out = Vec::new();
        for sample in samples {
            if ctx.is_in_maintenance(sample.timestamp) {
                continue;
            }
            if fast_score_of(sample.timestamp) < HIERARCHICAL_SCREEN_THRESHOLD {
                continue;
            }
            let confirming = if sophisticated_names.is_empty() {
                // No stage-2 detector is registered; the screen itself is
                // the verdict. Keep the lowest name for determinism.
                fast_results
                    .iter()
                    .flat_map(|r| r.anomalies.iter().filter(|a| a.timestamp == sample.timestamp).map(|a| (r.name.clone(), a)))
                    .min_by(|a, b| a.0.cmp(&b.0))
            } else {
                sophisticated_results
                    .iter()
                    .flat_map(|r| r.anomalies.iter().filter(|a| a.timestamp == sample.timestamp).map(|a| (r.name.clone(), a)))
                    .min_by(|a, b| a.0.cmp(&b.0))
            };
            let Some((winner_name, anomaly)) = confirming else {
                continue;
            };
            let combined = Anomaly::new(
                anomaly.kind,
                anomaly.score,
                anomaly.confidence,
                sample.clone(),
                format!("composite(hierarchical): {winner_name} confirmed"),
                anomaly.expected_value,
                anomaly.deviation,
                AnomalyContext { algorithm: "composite".into(), metric: sample.metric.clone(), ..anomaly.context.clone() },
            );
            if let Some(combined) = apply_business_rules(combined, &self.config.business_rules) {
                out.push(combined);
            }
        }
        out
    }
}

impl Detector for CompositeDetector {
    fn configure(&mut self, config: DetectorConfig) -> Result<()> {
        if let Some(strategy) = config.extra.get("ensembleStrategy").and_then(|v| v.as_str()) {
            self.strategy = match strategy {
                "majority_vote" => EnsembleStrategy::MajorityVote,
                "adaptive_weighted" => EnsembleStrategy::AdaptiveWeighted,
                "stacking" => EnsembleStrategy::Stacking,
                "hierarchical" => EnsembleStrategy::Hierarchical,
                _ => EnsembleStrategy::WeightedAverage,
            };
        }
        for child in &mut self.children {
            child.detector.configure(config.clone())?;
        }
        self.config = config;
        Ok(())
    }

    fn train(&mut self, historical: &[Sample]) -> Result<()> {
        if self.children.is_empty() {
            return Err(CoreError::Configuration("composite detector has no children".into()));
        }
        let mut any_ready = false;
        for child in &mut self.children {
            match child.detector.train(historical) {
                Ok(()) => any_ready = true,
                Err(_) => continue,
            }
        }
        self.ready = any_ready;
        self.trained_at = Some(chrono::Utc::now());
        if !self.ready {
            return Err(CoreError::InsufficientData { have: historical.len(), need: self.config.min_data_points });
        }
        Ok(())
    }

    fn detect(&mut self, samples: &[Sample], ctx: &DetectionContext) -> Vec<Anomaly> {
        if !self.ready || !self.config.enabled || samples.is_empty() {
            return Vec::new();
        }
        if self.strategy == EnsembleStrategy::Hierarchical {
            return self.detect_hierarchical(samples, ctx);
        }

        let per_child = self.sorted_candidates(samples, ctx);

        let mut by_sample: HashMap<i64, Vec<(String, f64, Option<&Anomaly>)>> = HashMap::new();
        for sample in samples {
            by_sample.insert(sample.timestamp, Vec::new());
        }
        for child in &per_child {
            let fired: HashMap<i64, &Anomaly> = child.anomalies.iter().map(|a| (a.timestamp, a)).collect();
            for sample in samples {
                let entry = by_sample.entry(sample.timestamp).or_default();
                entry.push((child.name.clone(), child.weight, fired.get(&sample.timestamp).copied()));
            }
        }

        let mut out = Vec::new();
        for sample in samples {
            if ctx.is_in_maintenance(sample.timestamp) {
                continue;
            }
            if let Some(votes) = by_sample.get(&sample.timestamp) {
                if let Some(anomaly) = self.combine(sample, ctx, votes) {
                    if let Some(anomaly) = apply_business_rules(anomaly, &self.config.business_rules) {
                        out.push(anomaly);
                    }
                }
            }
        }
        out
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.detector.reset();
        }
        self.performance.clear();
        self.ready = false;
        self.trained_at = None;
    }

    fn model_info(&self) -> ModelInfo {
        let mut parameters = HashMap::new();
        parameters.insert("strategy".into(), serde_json::json!(self.strategy));
        parameters.insert("children".into(), serde_json::json!(self.children.iter().map(|c| c.name.clone()).collect::<Vec<_>>()));
        ModelInfo {
            algorithm: "composite".into(),
            version: "1.0".into(),
            trained_at: self.trained_at,
            training_data_size: None,
            parameters,
        }
    }

    fn name(&self) -> &str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::isolation_forest::IsolationForestDetector;
    use crate::detectors::threshold::ThresholdDetector;
    use crate::detectors::zscore::ZScoreDetector;
    use crate::sample::{AnomalyContext as Ctx, AnomalyType, DetectionContext as DC};

    fn flat(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new("s1", "cpu", 50.0, i as i64 * 1000)).collect()
    }

    /// A mean-50 baseline with a small 5-point oscillation (std dev ~1.41)
    /// so the threshold/z-score detectors have a real band instead of the
    /// degenerate zero-variance band `flat` produces, which flags any
    /// nonzero deviation as a violation regardless of magnitude.
    fn noisy_baseline(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new("s1", "cpu", 50.0 + ((i % 5) as f64 - 2.0), i as i64 * 1000)).collect()
    }

    fn build_composite(strategy: EnsembleStrategy) -> CompositeDetector {
        let mut composite = CompositeDetector::new(strategy);
        composite.add_child("zscore", 1.0, Box::new(ZScoreDetector::new()));
        composite.add_child("threshold", 1.0, Box::new(ThresholdDetector::new()));
        composite
    }

    #[test]
    fn s6_hierarchical_returns_first_firing_child() {
        let mut composite = build_composite(EnsembleStrategy::Hierarchical);
        composite.configure(DetectorConfig { min_data_points: 10, threshold: 2.0, ..Default::default() }).unwrap();
        composite.train(&flat(40)).unwrap();
        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "cpu", 500.0, 41_000);
        let anomalies = composite.detect(&[spike], &ctx);
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn s6_hierarchical_benign_sample_never_invokes_sophisticated_stage() {
        let mut composite = build_composite(EnsembleStrategy::Hierarchical);
        composite.add_child("isolation_forest", 1.0, Box::new(IsolationForestDetector::new()));
        composite.configure(DetectorConfig { min_data_points: 10, threshold: 0.3, ..Default::default() }).unwrap();
        composite.train(&noisy_baseline(60)).unwrap();
        let ctx = DetectionContext::default();
        // Dead on the training mean: the fast screen should score this at
        // 0 and never run isolation_forest.
        let benign = Sample::new("s1", "cpu", 50.0, 61_000);
        let anomalies = composite.detect(&[benign], &ctx);
        assert!(anomalies.is_empty());
        assert!(
            !composite.performance.contains_key("isolation_forest"),
            "sophisticated stage must not run when the fast screen doesn't clear 0.3"
        );
    }

    #[test]
    fn hierarchical_confirms_with_sophisticated_stage_when_screen_clears() {
        let mut composite = build_composite(EnsembleStrategy::Hierarchical);
        composite.add_child("isolation_forest", 1.0, Box::new(IsolationForestDetector::new()));
        composite.configure(DetectorConfig { min_data_points: 10, threshold: 0.3, ..Default::default() }).unwrap();
        composite.train(&noisy_baseline(60)).unwrap();
        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "cpu", 5000.0, 61_000);
        let anomalies = composite.detect(&[spike], &ctx);
        assert_eq!(anomalies.len(), 1);
        assert!(
            composite.performance.contains_key("isolation_forest"),
            "a cleared screen must invoke the sophisticated stage"
        );
    }

    #[test]
    fn weighted_average_combines_agreeing_children() {
        let mut composite = build_composite(EnsembleStrategy::WeightedAverage);
        composite.configure(DetectorConfig { min_data_points: 10, threshold: 2.0, ..Default::default() }).unwrap();
        composite.train(&flat(40)).unwrap();
        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "cpu", 500.0, 41_000);
        let anomalies = composite.detect(&[spike], &ctx);
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].score > 0.0);
    }

    #[test]
    fn adaptive_weighted_applies_recent_deployment_boost_to_threshold() {
        let composite = build_composite(EnsembleStrategy::AdaptiveWeighted);
        let ctx_plain = DC::default();
        let ctx_deploy =
            DC { deployments: vec![crate::sample::Deployment { timestamp: 900, status: crate::sample::DeploymentStatus::Completed }], ..Default::default() };
        let plain = composite.adaptive_weight("threshold", 1.0, &ctx_plain, 1_000);
        let boosted = composite.adaptive_weight("threshold", 1.0, &ctx_deploy, 1_000);
        assert!(boosted > plain, "a recent deployment should boost threshold's adaptive weight");
        assert!((boosted - plain * 1.2).abs() < 1e-9);
    }

    #[test]
    fn adaptive_weighted_penalizes_slow_detector_under_low_latency() {
        let mut composite = build_composite(EnsembleStrategy::AdaptiveWeighted);
        composite.performance.insert(
            "threshold".into(),
            ChildPerformance { avg_response_time_ms: 10.0, ..ChildPerformance::default() },
        );
        let low_latency = DC { performance_requirements: crate::sample::PerformanceRequirements { low_latency: true, ..Default::default() }, ..Default::default() };
        let normal = DC::default();
        let penalized = composite.adaptive_weight("threshold", 1.0, &low_latency, 1_000);
        let unpenalized = composite.adaptive_weight("threshold", 1.0, &normal, 1_000);
        assert!(penalized < unpenalized);
        assert!((penalized - unpenalized * 0.8).abs() < 1e-9);
    }

    #[test]
    fn stacking_gate_rejects_low_confidence_votes() {
        let composite = build_composite(EnsembleStrategy::Stacking);
        let sample = Sample::new("s1", "cpu", 90.0, 1_000);
        let low_conf = Anomaly::new(
            AnomalyType::Spike,
            0.5,
            0.2,
            sample.clone(),
            "low confidence",
            None,
            0.0,
            Ctx::default(),
        );
        let voting: Vec<&(String, f64, Option<&Anomaly>)> = vec![&("zscore".to_string(), 1.0, Some(&low_conf))];
        assert!(composite.stacking_meta_score(&voting, &DC::default(), 1_000).is_none());
    }

    #[test]
    fn stacking_gate_accepts_strong_agreeing_votes() {
        let composite = build_composite(EnsembleStrategy::Stacking);
        let sample = Sample::new("s1", "cpu", 900.0, 1_000);
        let strong = Anomaly::new(AnomalyType::Spike, 0.95, 0.9, sample.clone(), "strong", None, 0.0, Ctx::default());
        let voting: Vec<&(String, f64, Option<&Anomaly>)> = vec![&("zscore".to_string(), 1.0, Some(&strong))];
        let result = composite.stacking_meta_score(&voting, &DC::default(), 1_000);
        assert!(result.is_some());
        assert!(result.unwrap().0 > 0.6);
    }

    #[test]
    fn maintenance_window_suppresses_composite_output() {
        let mut composite = build_composite(EnsembleStrategy::WeightedAverage);
        composite.configure(DetectorConfig { min_data_points: 10, threshold: 2.0, ..Default::default() }).unwrap();
        composite.train(&flat(40)).unwrap();
        let ctx = DetectionContext {
            maintenance_windows: vec![crate::sample::MaintenanceWindow { start: 40_000, end: 42_000 }],
            ..Default::default()
        };
        let spike = Sample::new("s1", "cpu", 500.0, 41_000);
        let anomalies = composite.detect(&[spike], &ctx);
        assert!(anomalies.is_empty());
    }
}
