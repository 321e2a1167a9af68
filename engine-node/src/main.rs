//! Process entry point: reads configuration, wires the engine together,
//! registers every detector, starts maintenance scheduling, feeds a demo
//! signal source, and shuts down gracefully on Ctrl-C.
//!
//! Grounded on `mitigation-node/src/main.rs`'s startup sequence: init
//! tracing, discover and load config with fallbacks, validate, construct
//! the component graph, run until a shutdown signal arrives.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use detection_core::alerting::Alerting;
use detection_core::clock::SystemClock;
use detection_core::collector::DataCollector;
use detection_core::detectors::composite::{CompositeDetector, EnsembleStrategy};
use detection_core::detectors::isolation_forest::IsolationForestDetector;
use detection_core::detectors::knn::KnnDetector;
use detection_core::detectors::ml_ensemble::MlEnsembleDetector;
use detection_core::detectors::seasonal::SeasonalDetector;
use detection_core::detectors::statistical::StatisticalDetector;
use detection_core::detectors::threshold::ThresholdDetector;
use detection_core::detectors::zscore::ZScoreDetector;
use detection_core::detectors::DetectorConfig;
use detection_core::engine::Engine;
use detection_core::events::EventBus;
use detection_core::orchestrator::Orchestrator;

use engine_node::config::EngineConfig;
use engine_node::demo_source;

fn discover_config_path() -> String {
    if let Ok(path) = env::var("ENGINE_CONFIG") {
        return path;
    }
    let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "development".into());
    for candidate in [
        format!("engine-node/config/{deployment_env}.toml"),
        format!("config/{deployment_env}.toml"),
        "engine-node/config/default.toml".to_string(),
        "config/default.toml".to_string(),
    ] {
        if std::path::Path::new(&candidate).exists() {
            return candidate;
        }
    }
    "config/default".to_string()
}

fn register_detectors(engine: &Engine) {
    engine.register_detector("zscore", Box::new(ZScoreDetector::new()));
    engine.register_detector("threshold", Box::new(ThresholdDetector::new()));
    engine.register_detector("statistical", Box::new(StatisticalDetector::new()));
    engine.register_detector("isolation_forest", Box::new(IsolationForestDetector::new()));
    engine.register_detector("seasonal", Box::new(SeasonalDetector::new()));
    engine.register_detector("knn", Box::new(KnnDetector::new()));
    engine.register_detector("ml_ensemble", Box::new(MlEnsembleDetector::new()));

    let mut composite = CompositeDetector::new(EnsembleStrategy::WeightedAverage);
    composite.add_child("zscore", 1.0, Box::new(ZScoreDetector::new()));
    composite.add_child("threshold", 1.0, Box::new(ThresholdDetector::new()));
    composite.add_child("statistical", 0.8, Box::new(StatisticalDetector::new()));
    engine.register_detector("composite", Box::new(composite));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "engine_node=info,detection_core=info".into()))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let config_path = discover_config_path();
    info!(path = %config_path, "loading configuration");
    let engine_config = EngineConfig::from_file(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "falling back to default configuration");
        EngineConfig::default()
    });
    if let Err(e) = engine_config.validate() {
        error!(error = %e, "configuration invalid, refusing to start");
        return Err(anyhow::anyhow!("invalid configuration: {e}"));
    }

    let _prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install metrics recorder: {e}"))?;
    metrics::describe_counter!("detections_total", "Number of samples passed through the active detector");
    metrics::describe_counter!("anomalies_total", "Number of anomalies produced by the active detector");
    metrics::describe_gauge!("detection_latency_ms", "Latency of the last detect() call");
    metrics::describe_counter!("alerts_created_total", "Alerts created after passing suppression and rate limiting");
    metrics::describe_counter!("alerts_suppressed_total", "Anomalies suppressed before alert creation");
    metrics::describe_counter!("alerts_rate_limited_total", "Anomalies dropped by rate limiting");

    let events = EventBus::default();
    let clock = Arc::new(SystemClock);
    let alerting = Arc::new(Alerting::new(events.clone(), clock.clone()));
    let engine = Arc::new(Engine::new(events.clone(), alerting, clock.clone()));
    register_detectors(&engine);
    engine
        .switch_detector(
            &engine_config.detector_type,
            DetectorConfig {
                sensitivity: engine_config.sensitivity,
                threshold: engine_config.threshold,
                window_size: engine_config.window_size,
                min_data_points: engine_config.min_data_points,
                seed: engine_config.seed,
                ..Default::default()
            },
        )
        .await?;

    let history: Vec<_> = (0..200)
        .map(|i| detection_core::sample::Sample::new("demo-cpu", "cpu_utilization", 40.0 + (i as f64 / 30.0).sin() * 5.0, i as i64 * 1000))
        .collect();
    engine.train(None, &history).await?;

    let collector = Arc::new(DataCollector::new(events.clone(), clock.clone(), engine_config.seed));
    let mut orchestrator = Orchestrator::new(engine.clone(), collector.clone(), events.clone(), clock.clone());
    orchestrator.start_maintenance();

    let demo_handle = tokio::spawn(demo_source::run(engine.clone(), clock.clone()));

    info!("engine started, active detector = {}", engine_config.detector_type);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    orchestrator.shutdown();
    demo_handle.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!("engine stopped");
    Ok(())
}
