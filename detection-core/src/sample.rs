//! Data model: `Sample`, `Anomaly`, `DataSource`, quality metrics, and the
//! tagged unions the design notes call for instead of ad-hoc maps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable numeric observation with metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub source: String,
    pub metric: String,
    pub value: f64,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Sample {
    pub fn new(source: impl Into<String>, metric: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            source: source.into(),
            metric: metric.into(),
            value,
            timestamp,
            labels: HashMap::new(),
            metadata: None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    Spike,
    Drop,
    TrendChange,
    SeasonalDeviation,
    Outlier,
    PatternBreak,
    ThresholdBreach,
    FrequencyAnomaly,
    CorrelationBreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity is a pure function of `score * confidence`, per the data
    /// model invariant: `>=0.9 critical, >=0.7 high, >=0.4 medium, else low`.
    pub fn from_score_confidence(score: f64, confidence: f64) -> Self {
        let adjusted = score * confidence;
        if adjusted >= 0.9 {
            Severity::Critical
        } else if adjusted >= 0.7 {
            Severity::High
        } else if adjusted >= 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyContext {
    pub metric: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub window_size: Option<usize>,
    pub algorithm: String,
    pub threshold: Option<f64>,
    pub historical_mean: Option<f64>,
    pub historical_std_dev: Option<f64>,
    pub seasonal_pattern: Option<String>,
    pub trend_direction: Option<String>,
    pub correlated_metrics: Option<Vec<String>>,
    pub business_context: Option<String>,
}

/// An emitted anomaly. Immutable once created except for `resolved`,
/// `resolved_at`, and `false_positive`, which are the only fields a caller
/// may mutate (via the alert-management facade, not directly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub severity: Severity,
    pub score: f64,
    pub confidence: f64,
    pub timestamp: i64,
    pub sample: Sample,
    pub description: String,
    pub expected_value: Option<f64>,
    pub actual_value: f64,
    pub deviation: f64,
    pub context: AnomalyContext,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub false_positive: Option<bool>,
}

impl Anomaly {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: AnomalyType,
        score: f64,
        confidence: f64,
        sample: Sample,
        description: impl Into<String>,
        expected_value: Option<f64>,
        deviation: f64,
        context: AnomalyContext,
    ) -> Self {
        let score = score.clamp(0.0, 1.0);
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            id: Uuid::new_v4(),
            kind,
            severity: Severity::from_score_confidence(score, confidence),
            score,
            confidence,
            timestamp: sample.timestamp,
            actual_value: sample.value,
            sample,
            description: description.into(),
            expected_value,
            deviation,
            context,
            resolved: false,
            resolved_at: None,
            false_positive: None,
        }
    }
}

/// Whether a timestamp (ms) falls inside any declared maintenance window.
/// A sample inside a maintenance window must never produce an anomaly.
pub fn in_maintenance_window(timestamp: i64, windows: &[MaintenanceWindow]) -> bool {
    windows
        .iter()
        .any(|w| timestamp >= w.start && timestamp <= w.end)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Deployment {
    pub timestamp: i64,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Started,
    Completed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerformanceRequirements {
    pub low_latency: bool,
    pub high_throughput: bool,
    pub high_accuracy: bool,
}

/// Context passed into `Detect`, shared by all detectors and the composite's
/// `ContextAnalyzer`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionContext {
    #[serde(default)]
    pub maintenance_windows: Vec<MaintenanceWindow>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    #[serde(default)]
    pub performance_requirements: PerformanceRequirements,
}

impl DetectionContext {
    pub fn is_in_maintenance(&self, timestamp: i64) -> bool {
        in_maintenance_window(timestamp, &self.maintenance_windows)
    }

    /// A deployment counts as "recent" if it started within the last
    /// `window_ms` before `timestamp`, per the adaptive-threshold and
    /// ensemble-weighting rules that apply a deployment penalty/boost.
    pub fn recent_deployment(&self, timestamp: i64, window_ms: i64) -> bool {
        self.deployments
            .iter()
            .any(|d| timestamp - d.timestamp <= window_ms && timestamp >= d.timestamp)
    }
}

/// Per-detector model metadata, common to every detector's state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub algorithm: String,
    pub version: String,
    pub trained_at: Option<DateTime<Utc>>,
    pub training_data_size: Option<usize>,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Rolling baseline statistics maintained per source by several detectors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_size: usize,
    pub last_updated: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_thresholds_match_spec_table() {
        assert_eq!(Severity::from_score_confidence(1.0, 1.0), Severity::Critical);
        assert_eq!(Severity::from_score_confidence(0.9, 1.0), Severity::Critical);
        assert_eq!(Severity::from_score_confidence(0.7, 1.0), Severity::High);
        assert_eq!(Severity::from_score_confidence(0.89, 1.0), Severity::High);
        assert_eq!(Severity::from_score_confidence(0.4, 1.0), Severity::Medium);
        assert_eq!(Severity::from_score_confidence(0.39, 1.0), Severity::Low);
        assert_eq!(Severity::from_score_confidence(0.0, 0.0), Severity::Low);
    }

    #[test]
    fn maintenance_window_is_inclusive() {
        let windows = vec![MaintenanceWindow { start: 100, end: 200 }];
        assert!(in_maintenance_window(100, &windows));
        assert!(in_maintenance_window(150, &windows));
        assert!(in_maintenance_window(200, &windows));
        assert!(!in_maintenance_window(201, &windows));
    }
}
