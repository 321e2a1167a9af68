//! Data Collector: per-source ingestion — sampling, filtering,
//! transformation, coercion to `Sample`, quality scoring, buffered batching.
//!
//! Modeled on `behavioral.rs`'s per-key sliding window with a periodic
//! cleanup task: each source gets a bounded buffer and a background flush
//! timer instead of a single global queue.

pub mod quality;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

pub use quality::{QualityMetrics, ValidationRule};

use crate::clock::{Clock, Scheduler, SystemClock, TimerHandle};
use crate::error::{CoreError, Result};
use crate::events::{Event, EventBus};
use crate::expr;
use crate::sample::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceType {
    Metrics,
    Logs,
    Traces,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equals,
    Contains,
    Regex,
    Range,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub negate: bool,
}

impl Filter {
    pub fn matches(&self, record: &Value) -> bool {
        let result = self.evaluate(record);
        if self.negate {
            !result
        } else {
            result
        }
    }

    fn evaluate(&self, record: &Value) -> bool {
        let field_value = expr::get_nested(record, &self.field);
        match self.op {
            FilterOp::Exists => field_value.is_some_and(|v| !v.is_null()),
            FilterOp::Equals => field_value.is_some_and(|v| values_equal(v, &self.value)),
            FilterOp::Contains => match field_value {
                Some(Value::String(s)) => self
                    .value
                    .as_str()
                    .is_some_and(|needle| s.contains(needle)),
                Some(Value::Array(arr)) => arr.iter().any(|v| values_equal(v, &self.value)),
                _ => false,
            },
            FilterOp::Regex => field_value.and_then(|v| v.as_str()).is_some_and(|s| {
                self.value
                    .as_str()
                    .and_then(|pattern| regex::Regex::new(pattern).ok())
                    .is_some_and(|re| re.is_match(s))
            }),
            FilterOp::Range => {
                let Some(num) = field_value.and_then(|v| v.as_f64()) else {
                    return false;
                };
                let min = self.value.get("min").and_then(|v| v.as_f64());
                let max = self.value.get("max").and_then(|v| v.as_f64());
                min.is_none_or(|m| num >= m) && max.is_none_or(|m| num <= m)
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x == y;
    }
    a == b
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMethod {
    Minmax,
    Zscore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transformation {
    Normalize {
        fields: Vec<String>,
        method: NormalizeMethod,
    },
    Aggregate {
        group_by: Vec<String>,
        aggregations: HashMap<String, AggOp>,
    },
    Derive {
        derivations: HashMap<String, String>,
    },
    Enrich {
        #[serde(default)]
        enrichments: HashMap<String, Value>,
    },
}

/// Applies one transformation to the whole batch, in list order. On error
/// the individual record (or field) is left untouched and the record still
/// progresses — a transformation failure never drops a record.
fn apply_transformation(records: Vec<Value>, t: &Transformation, now_ms: i64) -> Vec<Value> {
    match t {
        Transformation::Normalize { fields, method } => {
            let mut out = records;
            for field in fields {
                normalize_field(&mut out, field, *method);
            }
            out
        }
        Transformation::Aggregate {
            group_by,
            aggregations,
        } => aggregate(records, group_by, aggregations),
        Transformation::Derive { derivations } => {
            records
                .into_iter()
                .map(|mut record| {
                    for (name, expression) in derivations {
                        match expr::evaluate_value(expression, &record) {
                            Ok(value) => {
                                if let Value::Object(ref mut map) = record {
                                    map.insert(name.clone(), value);
                                }
                            }
                            Err(e) => {
                                warn!(derivation = %name, error = %e, "derive transformation failed, field skipped");
                            }
                        }
                    }
                    record
                })
                .collect()
        }
        Transformation::Enrich { enrichments } => records
            .into_iter()
            .map(|mut record| {
                if let Value::Object(ref mut map) = record {
                    if !map.contains_key("timestamp") {
                        map.insert("timestamp".into(), json!(now_ms));
                    }
                    for (k, v) in enrichments {
                        map.insert(k.clone(), v.clone());
                    }
                    map.insert(
                        "_metadata".into(),
                        json!({"enrichedAt": now_ms, "version": 1}),
                    );
                }
                record
            })
            .collect(),
    }
}

fn normalize_field(records: &mut [Value], field: &str, method: NormalizeMethod) {
    let values: Vec<f64> = records
        .iter()
        .filter_map(|r| expr::get_nested(r, field).and_then(|v| v.as_f64()))
        .collect();
    if values.is_empty() {
        return;
    }
    let (a, b) = match method {
        NormalizeMethod::Minmax => {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (min, max)
        }
        NormalizeMethod::Zscore => {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            (mean, variance.sqrt())
        }
    };
    for record in records.iter_mut() {
        let Value::Object(map) = record else { continue };
        let Some(raw) = map.get(field).and_then(|v| v.as_f64()) else {
            continue;
        };
        let normalized = match method {
            NormalizeMethod::Minmax => {
                if (b - a).abs() < f64::EPSILON {
                    0.0
                } else {
                    (raw - a) / (b - a)
                }
            }
            NormalizeMethod::Zscore => {
                if b == 0.0 {
                    0.0
                } else {
                    (raw - a) / b
                }
            }
        };
        map.insert(field.to_string(), json!(normalized));
    }
}

fn aggregate(records: Vec<Value>, group_by: &[String], aggregations: &HashMap<String, AggOp>) -> Vec<Value> {
    let mut groups: Vec<(Vec<String>, Vec<Value>)> = Vec::new();
    for record in records {
        let key: Vec<String> = group_by
            .iter()
            .map(|f| {
                expr::get_nested(&record, f)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            })
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(record),
            None => groups.push((key, vec![record])),
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = serde_json::Map::new();
            for (field, value) in group_by.iter().zip(key.iter()) {
                out.insert(field.clone(), Value::String(value.clone()));
            }
            for (field, op) in aggregations {
                let values: Vec<f64> = members
                    .iter()
                    .filter_map(|r| expr::get_nested(r, field).and_then(|v| v.as_f64()))
                    .collect();
                let result = match op {
                    AggOp::Sum => values.iter().sum::<f64>(),
                    AggOp::Avg => {
                        if values.is_empty() {
                            0.0
                        } else {
                            values.iter().sum::<f64>() / values.len() as f64
                        }
                    }
                    AggOp::Count => values.len() as f64,
                    AggOp::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
                    AggOp::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                };
                let suffix = match op {
                    AggOp::Sum => "sum",
                    AggOp::Avg => "avg",
                    AggOp::Count => "count",
                    AggOp::Min => "min",
                    AggOp::Max => "max",
                };
                out.insert(format!("{field}_{suffix}"), json!(result));
            }
            Value::Object(out)
        })
        .collect()
}

fn coerce_to_sample(record: &Value, source_id: &str, now_ms: i64) -> Sample {
    let metric = record
        .get("metric")
        .and_then(|v| v.as_str())
        .or_else(|| record.get("metricName").and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{source_id}_metric"));
    let value = record.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let timestamp = record
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .unwrap_or(now_ms);
    let labels: HashMap<String, String> = record
        .get("labels")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Sample {
        source: source_id.to_string(),
        metric,
        value,
        timestamp,
        labels,
        metadata: record.get("metadata").cloned(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub source_type: DataSourceType,
    pub enabled: bool,
    pub sampling_rate: f64,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub quality_anomaly_threshold: f64,
}

fn default_buffer_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: Uuid,
    pub source_id: String,
    pub samples: Vec<Sample>,
    pub quality_metrics: QualityMetrics,
    pub timestamp: i64,
    pub size: usize,
}

struct SourceState {
    config: DataSource,
    buffer: Vec<Sample>,
    rng: ChaCha8Rng,
    last_quality: QualityMetrics,
    timer: Option<TimerHandle>,
}

/// Per-source ingestion pipeline and buffered batching. Each source's state
/// lives behind its own `Mutex` so a `DashMap` shard lock is never held
/// across an `.await` point.
#[derive(Clone)]
pub struct DataCollector {
    sources: Arc<DashMap<String, Arc<Mutex<SourceState>>>>,
    events: EventBus,
    batch_tx: broadcast::Sender<Batch>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    seed: u64,
}

impl DataCollector {
    pub fn new(events: EventBus, clock: Arc<dyn Clock>, seed: u64) -> Self {
        let (batch_tx, _rx) = broadcast::channel(256);
        Self {
            sources: Arc::new(DashMap::new()),
            events,
            batch_tx,
            scheduler: Scheduler::new(clock.clone()),
            clock,
            seed,
        }
    }

    pub fn subscribe_batches(&self) -> broadcast::Receiver<Batch> {
        self.batch_tx.subscribe()
    }

    fn handle(&self, source_id: &str) -> Option<Arc<Mutex<SourceState>>> {
        self.sources.get(source_id).map(|e| e.clone())
    }

    /// Idempotent on `id`: re-registering an existing source updates its
    /// configuration in place without losing the current buffer.
    pub async fn register_source(&self, source: DataSource) {
        let id = source.id.clone();
        if let Some(handle) = self.handle(&id) {
            handle.lock().await.config = source;
            return;
        }

        let rng = ChaCha8Rng::seed_from_u64(self.seed ^ hash_str(&id));
        let flush_every = Duration::from_millis(source.flush_interval_ms.max(100));
        let state = SourceState {
            config: source,
            buffer: Vec::new(),
            rng,
            last_quality: QualityMetrics::default(),
            timer: None,
        };
        let handle = Arc::new(Mutex::new(state));
        self.sources.insert(id.clone(), handle.clone());

        let collector = self.clone();
        let source_id = id.clone();
        let timer = self.scheduler.schedule_periodic(flush_every, move || {
            let collector = collector.clone();
            let source_id = source_id.clone();
            async move {
                if let Err(e) = collector.flush(&source_id).await {
                    debug!(source = %source_id, error = %e, "scheduled flush failed");
                }
            }
        });
        handle.lock().await.timer = Some(timer);
    }

    pub async fn remove_source(&self, source_id: &str) -> Result<()> {
        match self.sources.remove(source_id) {
            Some((_, state)) => {
                if let Some(timer) = &state.lock().await.timer {
                    timer.cancel();
                }
                Ok(())
            }
            None => Err(CoreError::NotFound(format!("data source {source_id}"))),
        }
    }

    /// Sampling -> filtering -> transformation -> coercion -> quality
    /// scoring -> buffer append. Returns the number of samples placed into
    /// the buffer.
    pub async fn collect(&self, source_id: &str, raw: Vec<Value>) -> Result<usize> {
        let handle = self
            .handle(source_id)
            .ok_or_else(|| CoreError::NotFound(format!("data source {source_id}")))?;
        let mut state = handle.lock().await;
        if !state.config.enabled {
            return Ok(0);
        }

        let now_ms = self.clock.now_ms();

        // Sampling: Bernoulli at rate r; r=1 bypasses the RNG entirely.
        let rate = state.config.sampling_rate;
        let sampled: Vec<Value> = if rate >= 1.0 {
            raw
        } else {
            raw.into_iter()
                .filter(|_| state.rng.gen_range(0.0..1.0) < rate)
                .collect()
        };

        // Filtering: AND of all predicates; a filter error drops the record.
        let filters = state.config.filters.clone();
        let filtered: Vec<Value> = sampled
            .into_iter()
            .filter(|record| filters.iter().all(|f| f.matches(record)))
            .collect();

        // Transformations, applied in list order over the whole batch.
        let transformed = state
            .config
            .transformations
            .iter()
            .fold(filtered, |acc, t| apply_transformation(acc, t, now_ms));

        let mut samples: Vec<Sample> = transformed
            .iter()
            .map(|r| coerce_to_sample(r, source_id, now_ms))
            .filter(|s| s.is_finite())
            .collect();

        let quality = quality::score_batch(&samples, &state.config.validation_rules, now_ms);
        state.last_quality = quality;
        if quality.validity < 1.0 - state.config.quality_anomaly_threshold {
            self.events.publish(Event::DataQualityAnomaly {
                source_id: source_id.to_string(),
                validity: quality.validity,
            });
        }

        let count = samples.len();
        state.buffer.append(&mut samples);
        self.events.publish(Event::DataCollected {
            source_id: source_id.to_string(),
            count,
        });

        let should_flush = state.buffer.len() >= state.config.buffer_size;
        drop(state);
        if should_flush {
            self.flush(source_id).await?;
        }
        Ok(count)
    }

    /// Emits the current buffer as a batch to subscribers, clearing it.
    /// Also triggered by the per-source flush timer or a full buffer.
    pub async fn flush(&self, source_id: &str) -> Result<Option<Batch>> {
        let handle = self
            .handle(source_id)
            .ok_or_else(|| CoreError::NotFound(format!("data source {source_id}")))?;
        let mut state = handle.lock().await;
        if state.buffer.is_empty() {
            return Ok(None);
        }
        let samples = std::mem::take(&mut state.buffer);
        let batch = Batch {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            size: samples.len(),
            quality_metrics: state.last_quality,
            samples,
            timestamp: self.clock.now_ms(),
        };
        drop(state);

        self.events.publish(Event::DataBatchReady {
            batch_id: batch.id.to_string(),
            source_id: source_id.to_string(),
            size: batch.size,
        });
        // Subscriber unavailability is the one permitted dropping point; a
        // broadcast send failing because there are no receivers is not an
        // error for the collector.
        let _ = self.batch_tx.send(batch.clone());
        Ok(Some(batch))
    }
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn source(id: &str) -> DataSource {
        DataSource {
            id: id.to_string(),
            name: id.to_string(),
            source_type: DataSourceType::Metrics,
            enabled: true,
            sampling_rate: 1.0,
            filters: vec![],
            transformations: vec![],
            validation_rules: vec![],
            buffer_size: 1000,
            flush_interval_ms: 60_000,
            quality_anomaly_threshold: 0.1,
        }
    }

    #[tokio::test]
    async fn collect_then_flush_round_trips_samples() {
        let collector = DataCollector::new(EventBus::default(), Arc::new(SystemClock), 0);
        collector.register_source(source("s1")).await;
        let raw = vec![json!({"metric": "cpu", "value": 42.0, "timestamp": 1000})];
        let count = collector.collect("s1", raw).await.unwrap();
        assert_eq!(count, 1);
        let batch = collector.flush("s1").await.unwrap().unwrap();
        assert_eq!(batch.samples.len(), 1);
        assert_eq!(batch.samples[0].value, 42.0);
    }

    #[tokio::test]
    async fn filter_drops_non_matching_records() {
        let mut src = source("s2");
        src.filters.push(Filter {
            field: "value".into(),
            op: FilterOp::Range,
            value: json!({"min": 0.0, "max": 10.0}),
            negate: false,
        });
        let collector = DataCollector::new(EventBus::default(), Arc::new(SystemClock), 0);
        collector.register_source(src).await;
        let raw = vec![
            json!({"metric": "cpu", "value": 5.0, "timestamp": 1000}),
            json!({"metric": "cpu", "value": 500.0, "timestamp": 1000}),
        ];
        let count = collector.collect("s2", raw).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn derive_transform_adds_computed_field() {
        let mut src = source("s3");
        src.transformations.push(Transformation::Derive {
            derivations: HashMap::from([("value".to_string(), "raw / 1000".to_string())]),
        });
        let collector = DataCollector::new(EventBus::default(), Arc::new(SystemClock), 0);
        collector.register_source(src).await;
        let raw = vec![json!({"metric": "bytes", "raw": 5000.0, "timestamp": 1000})];
        collector.collect("s3", raw).await.unwrap();
        let batch = collector.flush("s3").await.unwrap().unwrap();
        assert_eq!(batch.samples[0].value, 5.0);
    }

    #[tokio::test]
    async fn buffer_auto_flushes_at_capacity() {
        let mut src = source("s4");
        src.buffer_size = 2;
        let collector = DataCollector::new(EventBus::default(), Arc::new(SystemClock), 0);
        collector.register_source(src).await;
        let mut rx = collector.subscribe_batches();
        let raw = vec![
            json!({"metric": "cpu", "value": 1.0, "timestamp": 1}),
            json!({"metric": "cpu", "value": 2.0, "timestamp": 2}),
        ];
        collector.collect("s4", raw).await.unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.size, 2);
    }
}
