//! End-to-end pipeline coverage: raw JSON ingested through the collector,
//! flushed as a batch, run through the engine's active detector, and
//! forwarded into alerting. The per-component unit tests exercise each
//! stage in isolation; this file chains them the way `main.rs` wires the
//! engine together, mirroring `mitigation-node/tests/integration_tests.rs`.

use std::sync::Arc;

use serde_json::json;

use detection_core::alerting::{Alerting, AlertingConfig, AlertRule, EscalationLevel, EscalationPolicy, RateLimiting};
use detection_core::clock::SystemClock;
use detection_core::collector::{DataCollector, DataSource, DataSourceType};
use detection_core::detectors::zscore::ZScoreDetector;
use detection_core::detectors::DetectorConfig;
use detection_core::engine::Engine;
use detection_core::events::EventBus;
use detection_core::sample::{DetectionContext, Sample, Severity};

fn always_fires_rule() -> AlertRule {
    AlertRule {
        enabled: true,
        severity_threshold: Severity::Low,
        metric_patterns: vec![],
        anomaly_types: vec![],
        escalation_policy: EscalationPolicy { levels: vec![EscalationLevel { delay_ms: 0, channels: vec!["email".into()] }] },
    }
}

fn steady_source(id: &str) -> DataSource {
    DataSource {
        id: id.to_string(),
        name: id.to_string(),
        source_type: DataSourceType::Metrics,
        enabled: true,
        sampling_rate: 1.0,
        filters: vec![],
        transformations: vec![],
        validation_rules: vec![],
        buffer_size: 500,
        flush_interval_ms: 60_000,
        quality_anomaly_threshold: 1.0,
    }
}

/// Raw records ingested via `collect` survive sampling/filtering/transform
/// untouched (rate 1.0, no filters, no transformations) and come out the
/// other end as a `Batch` of coerced `Sample`s ready for detection.
#[tokio::test]
async fn collector_batch_feeds_engine_which_flags_a_spike_and_opens_an_alert() {
    let events = EventBus::default();
    let clock = Arc::new(SystemClock);

    let alerting = Arc::new(Alerting::new(events.clone(), clock.clone()));
    alerting
        .configure(AlertingConfig {
            enabled: true,
            suppression_rules: vec![],
            rules: vec![always_fires_rule()],
            rate_limiting: RateLimiting { max_alerts_per_minute: 1000, max_alerts_per_hour: 10_000 },
        })
        .await;

    let engine = Arc::new(Engine::new(events.clone(), alerting.clone(), clock.clone()));
    engine.register_detector("zscore", Box::new(ZScoreDetector::new()));
    engine
        .switch_detector(
            "zscore",
            DetectorConfig { window_size: 50, min_data_points: 20, threshold: 3.0, ..Default::default() },
        )
        .await
        .expect("zscore is registered");

    let history: Vec<Sample> =
        (0..100).map(|i| Sample::new("checkout", "latency_ms", 50.0 + (i as f64 / 10.0).sin() * 5.0, i * 1000)).collect();
    engine.train(None, &history).await.expect("training on an oscillating baseline succeeds");

    let collector = DataCollector::new(events.clone(), clock.clone(), 0);
    collector.register_source(steady_source("checkout")).await;

    for i in 0..30 {
        let value = 50.0 + (i as f64 / 10.0).sin() * 5.0;
        let raw = vec![json!({"metric": "latency_ms", "value": value, "timestamp": i * 1000})];
        collector.collect("checkout", raw).await.expect("source is registered");
    }
    let spike = vec![json!({"metric": "latency_ms", "value": 5000.0, "timestamp": 31_000})];
    collector.collect("checkout", spike).await.expect("source is registered");

    let batch = collector.flush("checkout").await.expect("flush succeeds").expect("buffer was non-empty");
    assert_eq!(batch.source_id, "checkout");
    assert_eq!(batch.samples.len(), 31);
    assert!((batch.samples.last().unwrap().value - 5000.0).abs() < f64::EPSILON);

    let anomalies = engine
        .detect(&batch.samples, &DetectionContext::default())
        .await
        .expect("active detector is configured");
    assert!(!anomalies.is_empty(), "the spike sample should have been flagged");
    assert!(anomalies.iter().any(|a| (a.actual_value - 5000.0).abs() < f64::EPSILON));

    // `Engine::detect` forwards every anomaly to alerting itself; give the
    // forwarded task a moment and confirm an alert is now open.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(alerting.open_alert_count().await >= 1);
}

/// A maintenance window suppresses the detector before alerting ever sees
/// the anomaly, so no alert should open for samples inside it.
#[tokio::test]
async fn maintenance_window_suppresses_the_whole_pipeline() {
    let events = EventBus::default();
    let clock = Arc::new(SystemClock);

    let alerting = Arc::new(Alerting::new(events.clone(), clock.clone()));
    alerting
        .configure(AlertingConfig {
            enabled: true,
            suppression_rules: vec![],
            rules: vec![always_fires_rule()],
            rate_limiting: RateLimiting::default(),
        })
        .await;

    let engine = Arc::new(Engine::new(events.clone(), alerting.clone(), clock.clone()));
    engine.register_detector("zscore", Box::new(ZScoreDetector::new()));
    engine
        .switch_detector("zscore", DetectorConfig { window_size: 50, min_data_points: 20, threshold: 3.0, ..Default::default() })
        .await
        .expect("zscore is registered");

    let history: Vec<Sample> =
        (0..100).map(|i| Sample::new("checkout", "latency_ms", 50.0 + (i as f64 / 10.0).sin() * 5.0, i * 1000)).collect();
    engine.train(None, &history).await.expect("training succeeds");

    let collector = DataCollector::new(events.clone(), clock.clone(), 0);
    collector.register_source(steady_source("checkout")).await;
    let spike = vec![json!({"metric": "latency_ms", "value": 5000.0, "timestamp": 50_000})];
    collector.collect("checkout", spike).await.expect("source is registered");
    let batch = collector.flush("checkout").await.expect("flush succeeds").expect("buffer was non-empty");

    let ctx = DetectionContext {
        maintenance_windows: vec![detection_core::sample::MaintenanceWindow { start: 0, end: 100_000 }],
        ..Default::default()
    };
    let anomalies = engine.detect(&batch.samples, &ctx).await.expect("detect succeeds");
    assert!(anomalies.is_empty(), "maintenance window must suppress every anomaly");
    assert_eq!(alerting.open_alert_count().await, 0);
}

/// Fixed-window rate limiting drops anomalies past the configured cap even
/// though each one independently matches an alert rule.
#[tokio::test]
async fn rate_limiting_caps_alerts_from_a_burst_of_anomalies() {
    let events = EventBus::default();
    let clock = Arc::new(SystemClock);

    let alerting = Arc::new(Alerting::new(events.clone(), clock.clone()));
    alerting
        .configure(AlertingConfig {
            enabled: true,
            suppression_rules: vec![],
            rules: vec![always_fires_rule()],
            rate_limiting: RateLimiting { max_alerts_per_minute: 2, max_alerts_per_hour: 10_000 },
        })
        .await;

    let engine = Arc::new(Engine::new(events.clone(), alerting.clone(), clock.clone()));
    engine.register_detector("zscore", Box::new(ZScoreDetector::new()));
    engine
        .switch_detector("zscore", DetectorConfig { window_size: 50, min_data_points: 20, threshold: 3.0, ..Default::default() })
        .await
        .expect("zscore is registered");

    let history: Vec<Sample> =
        (0..100).map(|i| Sample::new("checkout", "latency_ms", 50.0 + (i as f64 / 10.0).sin() * 5.0, i * 1000)).collect();
    engine.train(None, &history).await.expect("training succeeds");

    let collector = DataCollector::new(events.clone(), clock.clone(), 0);
    collector.register_source(steady_source("checkout")).await;
    // Each spike is evaluated against the window as it stood before the
    // previous spike was pushed into it, so a short burst of huge outliers
    // keeps a wide enough margin over the threshold for every one of them
    // to be flagged individually.
    let raw: Vec<_> = (0..3)
        .map(|i| json!({"metric": "latency_ms", "value": 5000.0, "timestamp": 100_000 + i * 1000}))
        .collect();
    collector.collect("checkout", raw).await.expect("source is registered");
    let batch = collector.flush("checkout").await.expect("flush succeeds").expect("buffer was non-empty");

    let anomalies = engine.detect(&batch.samples, &DetectionContext::default()).await.expect("detect succeeds");
    assert_eq!(anomalies.len(), 3, "every spike sample should be individually flagged");

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(alerting.open_alert_count().await, 2, "only the first two should pass the per-minute cap");
}
