//! Performance Monitor: a ring buffer of recent detector performance
//! samples plus scale-up/scale-down advisories with cooldowns.
//!
//! Grounded on `resource_manager.rs`'s `CpuDataPoint` history buffer and
//! its consecutive-check debounce before acting on a scaling decision;
//! generalized here from fleet CPU to per-detector latency/throughput/
//! accuracy, and from "call a provisioning webhook" to "emit an advisory
//! event" since the core never spawns processes.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventBus};

const RING_CAPACITY: usize = 1000;
const SCALE_UP_COOLDOWN_MS: i64 = 5 * 60 * 1000;
const SCALE_DOWN_COOLDOWN_MS: i64 = 10 * 60 * 1000;
const TREND_DEADBAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub detection_latency_ms: f64,
    pub processing_time_ms: f64,
    pub memory_mb: f64,
    pub cpu_pct: f64,
    pub throughput_per_sec: f64,
    pub accuracy: f64,
    pub fpr: f64,
    pub fnr: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalingThresholds {
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub latency_ms: f64,
    pub throughput_per_sec: f64,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self { cpu_pct: 80.0, memory_mb: 1024.0, latency_ms: 200.0, throughput_per_sec: 10.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

struct DetectorHistory {
    records: VecDeque<PerformanceRecord>,
    last_scale_up: Option<i64>,
    last_scale_down: Option<i64>,
}

impl DetectorHistory {
    fn new() -> Self {
        Self { records: VecDeque::with_capacity(RING_CAPACITY), last_scale_up: None, last_scale_down: None }
    }

    fn push(&mut self, record: PerformanceRecord) {
        self.records.push_back(record);
        if self.records.len() > RING_CAPACITY {
            self.records.pop_front();
        }
    }
}

pub struct PerformanceMonitor {
    thresholds: ScalingThresholds,
    history: HashMap<String, DetectorHistory>,
    events: EventBus,
}

impl PerformanceMonitor {
    pub fn new(events: EventBus) -> Self {
        Self { thresholds: ScalingThresholds::default(), history: HashMap::new(), events }
    }

    pub fn configure(&mut self, thresholds: ScalingThresholds) {
        self.thresholds = thresholds;
    }

    /// Records a sample and immediately evaluates scaling advisories,
    /// matching the teacher's "every tick triggers an evaluation" pattern.
    pub fn record(&mut self, detector: &str, record: PerformanceRecord) {
        let now_ms = record.timestamp;
        let history = self.history.entry(detector.to_string()).or_insert_with(DetectorHistory::new);
        history.push(record);
        self.events.publish(Event::DetectorPerformanceRecorded { detector: detector.to_string() });

        if Self::should_scale_up(record, &self.thresholds) {
            let cooldown_elapsed = history.last_scale_up.is_none_or(|t| now_ms - t >= SCALE_UP_COOLDOWN_MS);
            if cooldown_elapsed {
                history.last_scale_up = Some(now_ms);
                self.events.publish(Event::DetectorScaledUp { detector: detector.to_string(), reason: Self::scale_up_reason(record, &self.thresholds) });
            }
        } else if let Some(reason) = Self::scale_down_reason(&history.records, &self.thresholds) {
            let cooldown_elapsed = history.last_scale_down.is_none_or(|t| now_ms - t >= SCALE_DOWN_COOLDOWN_MS);
            if cooldown_elapsed {
                history.last_scale_down = Some(now_ms);
                self.events.publish(Event::DetectorScaledDown { detector: detector.to_string(), reason });
            }
        }
    }

    fn should_scale_up(record: PerformanceRecord, thresholds: &ScalingThresholds) -> bool {
        record.cpu_pct > thresholds.cpu_pct
            || record.memory_mb > thresholds.memory_mb
            || record.detection_latency_ms > thresholds.latency_ms
            || record.throughput_per_sec < thresholds.throughput_per_sec
    }

    fn scale_up_reason(record: PerformanceRecord, thresholds: &ScalingThresholds) -> String {
        let mut reasons = Vec::new();
        if record.cpu_pct > thresholds.cpu_pct {
            reasons.push("cpu");
        }
        if record.memory_mb > thresholds.memory_mb {
            reasons.push("memory");
        }
        if record.detection_latency_ms > thresholds.latency_ms {
            reasons.push("latency");
        }
        if record.throughput_per_sec < thresholds.throughput_per_sec {
            reasons.push("throughput");
        }
        reasons.join(",")
    }

    fn scale_down_reason(records: &VecDeque<PerformanceRecord>, thresholds: &ScalingThresholds) -> Option<String> {
        if records.len() < 10 {
            return None;
        }
        let last_10: Vec<&PerformanceRecord> = records.iter().rev().take(10).collect();
        let avg_cpu = last_10.iter().map(|r| r.cpu_pct).sum::<f64>() / 10.0;
        let avg_mem = last_10.iter().map(|r| r.memory_mb).sum::<f64>() / 10.0;
        let avg_latency = last_10.iter().map(|r| r.detection_latency_ms).sum::<f64>() / 10.0;
        let avg_throughput = last_10.iter().map(|r| r.throughput_per_sec).sum::<f64>() / 10.0;

        let all_below_half = avg_cpu < 0.5 * thresholds.cpu_pct
            && avg_mem < 0.5 * thresholds.memory_mb
            && avg_latency < 0.5 * thresholds.latency_ms;
        let throughput_comfortable = avg_throughput > 1.5 * thresholds.throughput_per_sec;

        (all_below_half && throughput_comfortable).then(|| "sustained low utilization".to_string())
    }

    /// Trend over last-10 vs prior-10 samples, with a ±5% deadband around
    /// "unchanged" to avoid classifying noise as a trend.
    pub fn trend(&self, detector: &str) -> Option<Trend> {
        let history = self.history.get(detector)?;
        if history.records.len() < 20 {
            return None;
        }
        let records: Vec<&PerformanceRecord> = history.records.iter().collect();
        let n = records.len();
        let last_10: f64 = records[n - 10..].iter().map(|r| r.accuracy).sum::<f64>() / 10.0;
        let prior_10: f64 = records[n - 20..n - 10].iter().map(|r| r.accuracy).sum::<f64>() / 10.0;
        if prior_10.abs() < 1e-9 {
            return Some(Trend::Stable);
        }
        let change = (last_10 - prior_10) / prior_10;
        Some(if change > TREND_DEADBAND {
            Trend::Improving
        } else if change < -TREND_DEADBAND {
            Trend::Degrading
        } else {
            Trend::Stable
        })
    }

    pub fn recent(&self, detector: &str, n: usize) -> Vec<PerformanceRecord> {
        self.history.get(detector).map(|h| h.records.iter().rev().take(n).rev().copied().collect()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cpu: f64, ts: i64) -> PerformanceRecord {
        PerformanceRecord {
            detection_latency_ms: 10.0,
            processing_time_ms: 5.0,
            memory_mb: 100.0,
            cpu_pct: cpu,
            throughput_per_sec: 50.0,
            accuracy: 0.9,
            fpr: 0.01,
            fnr: 0.01,
            timestamp: ts,
        }
    }

    #[test]
    fn high_cpu_triggers_scale_up_advisory() {
        let mut monitor = PerformanceMonitor::new(EventBus::default());
        monitor.record("zscore", record(95.0, 1000));
        let history = monitor.history.get("zscore").unwrap();
        assert!(history.last_scale_up.is_some());
    }

    #[test]
    fn scale_up_respects_cooldown() {
        let mut monitor = PerformanceMonitor::new(EventBus::default());
        monitor.record("zscore", record(95.0, 1000));
        monitor.record("zscore", record(95.0, 2000));
        let history = monitor.history.get("zscore").unwrap();
        assert_eq!(history.last_scale_up, Some(1000));
    }

    #[test]
    fn ring_buffer_caps_at_1000() {
        let mut monitor = PerformanceMonitor::new(EventBus::default());
        for i in 0..1200 {
            monitor.record("zscore", record(10.0, i as i64));
        }
        let history = monitor.history.get("zscore").unwrap();
        assert_eq!(history.records.len(), 1000);
    }

    #[test]
    fn sustained_low_utilization_triggers_scale_down() {
        let mut monitor = PerformanceMonitor::new(EventBus::default());
        for i in 0..12 {
            monitor.record("zscore", PerformanceRecord { cpu_pct: 5.0, memory_mb: 10.0, detection_latency_ms: 1.0, throughput_per_sec: 100.0, ..record(5.0, i as i64 * 1000) });
        }
        let history = monitor.history.get("zscore").unwrap();
        assert!(history.last_scale_down.is_some());
    }
}
