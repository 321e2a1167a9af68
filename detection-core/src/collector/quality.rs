//! Per-batch quality scoring: six axes in `[0,1]` describing how trustworthy
//! a batch of samples is, plus the validation rules that feed `validity`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::expr;
use crate::sample::Sample;

const MAX_AGE_MS: i64 = 60 * 60 * 1000; // 1 hour, per spec

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    Required { field: String },
    Range { field: String, min: f64, max: f64 },
    Regex { field: String, pattern: String },
    Custom { expression: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub timeliness: f64,
    pub validity: f64,
    pub uniqueness: f64,
    pub timestamp: DateTime<Utc>,
}

impl Default for QualityMetrics {
    fn default() -> Self {
        Self {
            completeness: 1.0,
            accuracy: 1.0,
            consistency: 1.0,
            timeliness: 1.0,
            validity: 1.0,
            uniqueness: 1.0,
            timestamp: Utc::now(),
        }
    }
}

fn sample_as_value(sample: &Sample) -> serde_json::Value {
    json!({
        "source": sample.source,
        "metric": sample.metric,
        "value": sample.value,
        "timestamp": sample.timestamp,
        "labels": sample.labels,
    })
}

fn check_rule(rule: &ValidationRule, sample: &Sample) -> bool {
    match rule {
        ValidationRule::Required { field } => {
            let v = sample_as_value(sample);
            expr::get_nested(&v, field)
                .map(|val| !val.is_null())
                .unwrap_or(false)
        }
        ValidationRule::Range { field, min, max } => {
            let v = sample_as_value(sample);
            expr::get_nested(&v, field)
                .and_then(|val| val.as_f64())
                .map(|n| n >= *min && n <= *max)
                .unwrap_or(false)
        }
        ValidationRule::Regex { field, pattern } => {
            let v = sample_as_value(sample);
            let Some(s) = expr::get_nested(&v, field).and_then(|val| val.as_str()) else {
                return false;
            };
            regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false)
        }
        ValidationRule::Custom { expression } => {
            let v = sample_as_value(sample);
            expr::evaluate(expression, &v).unwrap_or(false)
        }
    }
}

/// Scores a batch along the six quality axes defined by the data model.
pub fn score_batch(samples: &[Sample], rules: &[ValidationRule], now_ms: i64) -> QualityMetrics {
    if samples.is_empty() {
        return QualityMetrics::default();
    }

    let required_fields_present = samples
        .iter()
        .map(|s| {
            let mut present = 0u32;
            if !s.metric.is_empty() {
                present += 1;
            }
            if s.value.is_finite() {
                present += 1;
            }
            if s.timestamp > 0 {
                present += 1;
            }
            f64::from(present) / 3.0
        })
        .sum::<f64>()
        / samples.len() as f64;

    let validity = if rules.is_empty() {
        1.0
    } else {
        let mut total = 0usize;
        let mut valid = 0usize;
        for sample in samples {
            for rule in rules {
                total += 1;
                if check_rule(rule, sample) {
                    valid += 1;
                }
            }
        }
        if total == 0 {
            1.0
        } else {
            valid as f64 / total as f64
        }
    };

    let timeliness = samples
        .iter()
        .map(|s| {
            let age = (now_ms - s.timestamp).max(0) as f64;
            (1.0 - age / MAX_AGE_MS as f64).max(0.0)
        })
        .sum::<f64>()
        / samples.len() as f64;

    let same_metric = samples.windows(2).all(|w| w[0].metric == w[1].metric);
    let metric_consistency = if same_metric { 1.0 } else { 0.5 };
    let outlier_ratio = outlier_ratio_3sigma(samples);
    let consistency = (metric_consistency + (1.0 - outlier_ratio)) / 2.0;

    let mut timestamps: Vec<i64> = samples.iter().map(|s| s.timestamp).collect();
    timestamps.sort_unstable();
    timestamps.dedup();
    let uniqueness = timestamps.len() as f64 / samples.len() as f64;

    // Documented approximation: accuracy tracks validity.
    let accuracy = validity;

    QualityMetrics {
        completeness: required_fields_present,
        accuracy,
        consistency,
        timeliness,
        validity,
        uniqueness,
        timestamp: Utc::now(),
    }
}

fn outlier_ratio_3sigma(samples: &[Sample]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    let outliers = values
        .iter()
        .filter(|v| ((*v - mean) / std_dev).abs() > 3.0)
        .count();
    outliers as f64 / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(metric: &str, value: f64, timestamp: i64) -> Sample {
        Sample::new("src", metric, value, timestamp)
    }

    #[test]
    fn empty_batch_has_perfect_default_score() {
        let metrics = score_batch(&[], &[], 0);
        assert_eq!(metrics.completeness, 1.0);
    }

    #[test]
    fn uniform_metric_batch_is_fully_consistent() {
        let samples = vec![sample("cpu", 1.0, 1000), sample("cpu", 2.0, 2000)];
        let metrics = score_batch(&samples, &[], 3_000);
        assert_eq!(metrics.consistency, 1.0);
        assert_eq!(metrics.uniqueness, 1.0);
    }

    #[test]
    fn stale_samples_lower_timeliness() {
        let samples = vec![sample("cpu", 1.0, 0)];
        let metrics = score_batch(&samples, &[], 10 * 60 * 60 * 1000);
        assert_eq!(metrics.timeliness, 0.0);
    }

    #[test]
    fn validity_reflects_rule_pass_rate() {
        let samples = vec![sample("cpu", 150.0, 1000)];
        let rules = vec![ValidationRule::Range {
            field: "value".into(),
            min: 0.0,
            max: 100.0,
        }];
        let metrics = score_batch(&samples, &rules, 1000);
        assert_eq!(metrics.validity, 0.0);
    }
}
