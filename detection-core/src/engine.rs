//! Detector Registry / Engine: the single entry point that forwards a
//! batch of samples to the active detector, records timing into the
//! Performance Monitor, bounds per-detector anomaly history, forwards
//! each anomaly to Alerting, emits a completion event, and appends an
//! audit entry.
//!
//! Grounded on `resource_manager.rs`'s `ResourceManager`, which holds a
//! `DashMap`-backed registry and runs one evaluation per tick; here the
//! registry holds detectors instead of fleet nodes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::alerting::Alerting;
use crate::clock::Clock;
use crate::detectors::{Detector, DetectorConfig};
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};
use crate::performance::{PerformanceMonitor, PerformanceRecord};
use crate::sample::{Anomaly, DetectionContext, ModelInfo, Sample};

const MAX_ANOMALY_HISTORY: usize = 10_000;

/// One append-only entry recording an engine action, for the persisted
/// audit trail the orchestrator periodically snapshots.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub timestamp: i64,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DetectorReport {
    pub name: String,
    pub recent_anomalies: Vec<Anomaly>,
    pub total_detections: usize,
    pub model_info: ModelInfo,
}

struct RegisteredDetector {
    detector: Box<dyn Detector>,
    history: VecDeque<Anomaly>,
    total_detections: usize,
}

/// The registry/engine. Holds named detectors, the currently active one,
/// and the collaborators every `Detect` call forwards to.
pub struct Engine {
    detectors: DashMap<String, RegisteredDetector>,
    active: RwLock<String>,
    alerting: Arc<Alerting>,
    performance: RwLock<PerformanceMonitor>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    audit_log: RwLock<Vec<AuditEntry>>,
}

impl Engine {
    pub fn new(events: EventBus, alerting: Arc<Alerting>, clock: Arc<dyn Clock>) -> Self {
        Self {
            detectors: DashMap::new(),
            active: RwLock::new(String::new()),
            alerting,
            performance: RwLock::new(PerformanceMonitor::new(events.clone())),
            events,
            clock,
            audit_log: RwLock::new(Vec::new()),
        }
    }

    pub fn register_detector(&self, name: impl Into<String>, detector: Box<dyn Detector>) {
        let name = name.into();
        self.detectors.insert(name, RegisteredDetector { detector, history: VecDeque::new(), total_detections: 0 });
    }

    /// Atomically switches the active detector, reconfiguring it with the
    /// engine's current shared config. Fails fatally (per the error-design
    /// note) if `name` was never registered.
    pub async fn switch_detector(&self, name: &str, config: DetectorConfig) -> Result<bool> {
        let mut entry = self
            .detectors
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownDetectorType(name.to_string()))?;
        entry.detector.configure(config)?;
        drop(entry);
        *self.active.write().await = name.to_string();
        self.audit(format!("switched active detector to {name}")).await;
        Ok(true)
    }

    /// Trains a registered detector on historical samples. Trains the
    /// active detector when `name` is `None`.
    pub async fn train(&self, name: Option<&str>, historical: &[Sample]) -> Result<()> {
        let name = match name {
            Some(n) => n.to_string(),
            None => self.active.read().await.clone(),
        };
        if name.is_empty() {
            return Err(CoreError::InvalidState("no active detector selected".into()));
        }
        let mut entry = self
            .detectors
            .get_mut(&name)
            .ok_or_else(|| CoreError::UnknownDetectorType(name.clone()))?;
        entry.detector.train(historical)?;
        drop(entry);
        self.audit(format!("trained detector {name} on {} samples", historical.len())).await;
        Ok(())
    }

    async fn audit(&self, detail: impl Into<String>) {
        let entry = AuditEntry { timestamp: self.clock.now_ms(), action: "engine".into(), detail: detail.into() };
        self.audit_log.write().await.push(entry);
    }

    /// Forwards `samples` to the active detector, records latency, bounds
    /// history, forwards each anomaly to alerting, and emits a completion
    /// event.
    #[instrument(skip(self, samples, ctx))]
    pub async fn detect(&self, samples: &[Sample], ctx: &DetectionContext) -> Result<Vec<Anomaly>> {
        let active_name = self.active.read().await.clone();
        if active_name.is_empty() {
            return Err(CoreError::InvalidState("no active detector selected".into()));
        }

        let started = Instant::now();
        let anomalies = {
            let mut entry = self
                .detectors
                .get_mut(&active_name)
                .ok_or_else(|| CoreError::UnknownDetectorType(active_name.clone()))?;
            entry.detector.detect(samples, ctx)
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        gauge!("detection_latency_ms", elapsed_ms);
        counter!("detections_total", samples.len() as u64);
        counter!("anomalies_total", anomalies.len() as u64);

        {
            let mut entry = self.detectors.get_mut(&active_name).expect("detector present after detect");
            entry.total_detections += samples.len();
            for anomaly in &anomalies {
                entry.history.push_back(anomaly.clone());
                if entry.history.len() > MAX_ANOMALY_HISTORY {
                    entry.history.pop_front();
                }
            }
        }

        self.performance.write().await.record(
            &active_name,
            PerformanceRecord {
                detection_latency_ms: elapsed_ms,
                processing_time_ms: elapsed_ms,
                memory_mb: 0.0,
                cpu_pct: 0.0,
                throughput_per_sec: if elapsed_ms > 0.0 { samples.len() as f64 / (elapsed_ms / 1000.0) } else { samples.len() as f64 },
                accuracy: 1.0,
                fpr: 0.0,
                fnr: 0.0,
                timestamp: self.clock.now_ms(),
            },
        );

        for anomaly in &anomalies {
            if let Err(e) = self.forward_to_alerting(anomaly.clone()).await {
                warn!(error = %e, "alerting failed to process anomaly");
            }
        }

        self.events.publish(Event::AnomalyDetectionCompleted {
            detector: active_name.clone(),
            anomalies: anomalies.len(),
            samples: samples.len(),
        });
        self.audit(format!("detector {active_name} processed {} samples, {} anomalies", samples.len(), anomalies.len())).await;

        Ok(anomalies)
    }

    async fn forward_to_alerting(&self, anomaly: Anomaly) -> Result<()> {
        self.alerting.process_anomaly(anomaly).await;
        Ok(())
    }

    pub async fn acknowledge(&self, alert_id: uuid::Uuid, user: &str) -> Result<bool> {
        self.alerting.acknowledge(alert_id, user).await
    }

    pub async fn resolve(&self, alert_id: uuid::Uuid) -> Result<bool> {
        self.alerting.resolve(alert_id).await
    }

    /// Either a single detector's last-100 anomalies + stats, or (if `name`
    /// is `None`) a report across every registered detector.
    pub fn get_report(&self, name: Option<&str>) -> Vec<DetectorReport> {
        let build = |name: &str, entry: &RegisteredDetector| DetectorReport {
            name: name.to_string(),
            recent_anomalies: entry.history.iter().rev().take(100).rev().cloned().collect(),
            total_detections: entry.total_detections,
            model_info: entry.detector.model_info(),
        };

        match name {
            Some(name) => self.detectors.get(name).map(|e| vec![build(name, &e)]).unwrap_or_default(),
            None => self.detectors.iter().map(|e| build(e.key(), e.value())).collect(),
        }
    }

    pub async fn get_system_status(&self) -> HashMap<String, serde_json::Value> {
        let mut status = HashMap::new();
        status.insert("active_detector".into(), serde_json::json!(*self.active.read().await));
        status.insert("registered_detectors".into(), serde_json::json!(self.detectors.iter().map(|e| e.key().clone()).collect::<Vec<_>>()));
        status.insert("open_alerts".into(), serde_json::json!(self.alerting.open_alert_count().await));
        status
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit_log.read().await.clone()
    }

    /// Trims every detector's anomaly history down to `policy`: drops
    /// entries older than `max_age_ms` and caps what remains at `max_size`
    /// most-recent entries. Run periodically by the orchestrator's daily
    /// maintenance loop rather than on every `detect()` call.
    pub async fn apply_retention(&self, policy: &crate::orchestrator::RetentionPolicy) {
        let now_ms = self.clock.now_ms();
        let cutoff = now_ms - policy.max_age_ms;
        let mut trimmed = 0usize;
        for mut entry in self.detectors.iter_mut() {
            let before = entry.history.len();
            entry.history.retain(|a| a.timestamp >= cutoff);
            while entry.history.len() > policy.max_size {
                entry.history.pop_front();
            }
            trimmed += before - entry.history.len();
        }
        if trimmed > 0 {
            self.audit(format!("retention pass trimmed {trimmed} anomalies across detectors")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::detectors::zscore::ZScoreDetector;

    fn flat(n: usize) -> Vec<Sample> {
        (0..n).map(|i| Sample::new("s1", "cpu", 50.0, i as i64 * 1000)).collect()
    }

    async fn test_engine() -> Engine {
        let events = EventBus::default();
        let alerting = Arc::new(Alerting::new(events.clone(), Arc::new(SystemClock)));
        Engine::new(events, alerting, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn switch_to_unknown_detector_errors() {
        let engine = test_engine().await;
        let result = engine.switch_detector("nope", DetectorConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn detect_without_active_detector_errors() {
        let engine = test_engine().await;
        let ctx = DetectionContext::default();
        assert!(engine.detect(&flat(1), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn switch_then_train_then_detect_records_history() {
        let engine = test_engine().await;
        engine.register_detector("zscore", Box::new(ZScoreDetector::new()));
        engine.switch_detector("zscore", DetectorConfig { min_data_points: 10, threshold: 3.0, ..Default::default() }).await.unwrap();

        {
            let mut entry = engine.detectors.get_mut("zscore").unwrap();
            entry.detector.train(&flat(40)).unwrap();
        }

        let ctx = DetectionContext::default();
        let spike = Sample::new("s1", "cpu", 500.0, 41_000);
        let anomalies = engine.detect(&[spike], &ctx).await.unwrap();
        assert_eq!(anomalies.len(), 1);

        let report = engine.get_report(Some("zscore"));
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].recent_anomalies.len(), 1);
    }

    #[tokio::test]
    async fn retention_drops_entries_older_than_max_age_and_caps_size() {
        use crate::sample::{Anomaly, AnomalyContext, AnomalyType};

        let engine = test_engine().await;
        engine.register_detector("zscore", Box::new(ZScoreDetector::new()));

        let now = SystemClock.now_ms();
        let make = |ts: i64| {
            let sample = Sample::new("s1", "cpu", 50.0, ts);
            Anomaly::new(AnomalyType::Spike, 0.9, 0.9, sample, "test", None, 1.0, AnomalyContext {
                metric: "cpu".into(),
                labels: Default::default(),
                window_size: None,
                algorithm: "zscore".into(),
                threshold: None,
                historical_mean: None,
                historical_std_dev: None,
                seasonal_pattern: None,
                trend_direction: None,
                correlated_metrics: None,
                business_context: None,
            })
        };

        {
            let mut entry = engine.detectors.get_mut("zscore").unwrap();
            entry.history.push_back(make(now - 10 * 24 * 3_600_000)); // 10 days old
            entry.history.push_back(make(now - 1000)); // recent
        }

        engine
            .apply_retention(&crate::orchestrator::RetentionPolicy { max_age_ms: 7 * 24 * 3_600_000, max_size: 100_000, compression_after_ms: 24 * 3_600_000 })
            .await;

        let report = engine.get_report(Some("zscore"));
        assert_eq!(report[0].recent_anomalies.len(), 1);

        {
            let mut entry = engine.detectors.get_mut("zscore").unwrap();
            for i in 0..50 {
                entry.history.push_back(make(now - 500 + i));
            }
        }
        engine
            .apply_retention(&crate::orchestrator::RetentionPolicy { max_age_ms: 7 * 24 * 3_600_000, max_size: 10, compression_after_ms: 24 * 3_600_000 })
            .await;
        let entry = engine.detectors.get("zscore").unwrap();
        assert_eq!(entry.history.len(), 10);
    }
}
