//! Streaming anomaly-detection engine for operational time-series signals.
//!
//! Layout mirrors the component design: data collection, detectors, the
//! registry/engine that forwards between them, alerting, performance
//! monitoring, and the orchestrator tying it all together. Clock,
//! scheduler, and event bus are injected dependencies rather than process
//! singletons throughout.

pub mod alerting;
pub mod clock;
pub mod collector;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod orchestrator;
pub mod performance;
pub mod sample;

pub use clock::{Clock, Scheduler, SystemClock, TimerHandle};
pub use engine::Engine;
pub use error::{CoreError, Result};
pub use events::{Event, EventBus};
pub use orchestrator::Orchestrator;
pub use sample::{Anomaly, AnomalyType, Sample, Severity};
