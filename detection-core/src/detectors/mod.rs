//! Detector capability interface and shared business-rule machinery.
//!
//! Child-detector facades are a small capability trait
//! (`Configure`/`Train`/`Detect`/`IsReady`/`Reset`/`ModelInfo`); optional
//! capabilities (baseline, thresholds, feature importance, prediction) are
//! additional trait bounds a concrete detector may also implement, rather
//! than reflective feature tests, per the design notes.

pub mod composite;
pub mod isolation_forest;
pub mod knn;
pub mod ml_ensemble;
pub mod seasonal;
pub mod statistical;
pub mod threshold;
pub mod zscore;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expr;
use crate::sample::{Anomaly, DetectionContext, ModelInfo, Sample};

/// One business/suppression rule: `condition` is evaluated (via the
/// sandboxed expression evaluator) against the candidate anomaly; `action`
/// decides what happens to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRule {
    pub condition: String,
    pub action: BusinessRuleAction,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessRuleAction {
    Suppress,
    Escalate,
    AutoResolve,
}

/// Common configuration every detector accepts, per the recognized
/// configuration schema (`sensitivity`, `threshold`, `windowSize`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
    #[serde(default)]
    pub business_rules: Vec<BusinessRule>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}
fn default_sensitivity() -> f64 {
    0.5
}
fn default_threshold() -> f64 {
    3.0
}
fn default_window_size() -> usize {
    100
}
fn default_min_data_points() -> usize {
    30
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: default_sensitivity(),
            threshold: default_threshold(),
            window_size: default_window_size(),
            min_data_points: default_min_data_points(),
            business_rules: Vec::new(),
            seed: 0,
            extra: HashMap::new(),
        }
    }
}

/// Capability interface every detector implements. Detectors are stateful:
/// `Train` updates internal baselines, `Detect` classifies new samples
/// against that state.
pub trait Detector: Send + Sync {
    fn configure(&mut self, config: DetectorConfig) -> Result<()>;

    /// Fails with `InsufficientData` if `historical.len() < min_data_points`.
    /// The detector remains `is_ready() == false` on failure.
    fn train(&mut self, historical: &[Sample]) -> Result<()>;

    /// Returns `[]` if `!is_ready()` or the detector is disabled. Any sample
    /// whose timestamp lies within a maintenance window is silently
    /// skipped. Each candidate anomaly passes through business rules before
    /// being returned.
    fn detect(&mut self, samples: &[Sample], ctx: &DetectionContext) -> Vec<Anomaly>;

    fn is_ready(&self) -> bool;

    fn reset(&mut self);

    fn model_info(&self) -> ModelInfo;

    fn name(&self) -> &str;
}

/// Optional capability: baselines.
pub trait HasBaseline {
    fn get_baseline(&self, source: &str) -> Option<crate::sample::Baseline>;
    fn set_baseline(&mut self, source: &str, baseline: crate::sample::Baseline);
}

/// Optional capability: feature importance reporting.
pub trait FeatureImportance {
    fn feature_importance(&self, source: &str) -> HashMap<String, f64>;
}

/// Optional capability: forward forecasting.
pub trait Predictor {
    fn predict(&self, source: &str, steps: usize) -> Vec<f64>;
}

/// Runs a candidate anomaly through an ordered list of business rules.
/// Returns `None` if a `suppress` rule matched (the anomaly is dropped);
/// otherwise returns the (possibly mutated) anomaly.
pub fn apply_business_rules(mut anomaly: Anomaly, rules: &[BusinessRule]) -> Option<Anomaly> {
    let record = anomaly_as_value(&anomaly);
    for rule in rules {
        let matched = expr::evaluate(&rule.condition, &record).unwrap_or(false);
        if !matched {
            continue;
        }
        match rule.action {
            BusinessRuleAction::Suppress => return None,
            BusinessRuleAction::Escalate => {
                anomaly.severity = crate::sample::Severity::Critical;
            }
            BusinessRuleAction::AutoResolve => {
                anomaly.resolved = true;
                anomaly.resolved_at = Some(chrono::Utc::now());
            }
        }
    }
    Some(anomaly)
}

fn anomaly_as_value(anomaly: &Anomaly) -> serde_json::Value {
    serde_json::json!({
        "type": anomaly.kind,
        "severity": anomaly.severity,
        "score": anomaly.score,
        "confidence": anomaly.confidence,
        "metric": anomaly.context.metric,
        "actual_value": anomaly.actual_value,
        "expected_value": anomaly.expected_value,
        "deviation": anomaly.deviation,
        "labels": anomaly.context.labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Anomaly, AnomalyContext, AnomalyType, Sample};

    fn anomaly() -> Anomaly {
        Anomaly::new(
            AnomalyType::Spike,
            0.5,
            0.5,
            Sample::new("s", "cpu", 100.0, 1000),
            "test",
            Some(50.0),
            50.0,
            AnomalyContext {
                metric: "cpu".into(),
                algorithm: "zscore".into(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn suppress_rule_drops_anomaly() {
        let rules = vec![BusinessRule {
            condition: "score > 0.1".into(),
            action: BusinessRuleAction::Suppress,
            description: String::new(),
        }];
        assert!(apply_business_rules(anomaly(), &rules).is_none());
    }

    #[test]
    fn escalate_rule_bumps_severity() {
        let rules = vec![BusinessRule {
            condition: "score > 0.1".into(),
            action: BusinessRuleAction::Escalate,
            description: String::new(),
        }];
        let result = apply_business_rules(anomaly(), &rules).unwrap();
        assert_eq!(result.severity, crate::sample::Severity::Critical);
    }

    #[test]
    fn non_matching_rule_leaves_anomaly_untouched() {
        let rules = vec![BusinessRule {
            condition: "score > 0.99".into(),
            action: BusinessRuleAction::Suppress,
            description: String::new(),
        }];
        let result = apply_business_rules(anomaly(), &rules).unwrap();
        assert_eq!(result.score, 0.5);
    }
}
