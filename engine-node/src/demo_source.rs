//! Synthetic signal generator so the binary produces useful output with no
//! external data source wired up. Modeled on `mitigation-node/src/test_origin.rs`'s
//! role as a standalone exerciser, here run as a library-internal task
//! rather than a second binary.

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use detection_core::clock::Clock;
use detection_core::engine::Engine;
use detection_core::sample::{DetectionContext, Sample};

const TICK: Duration = Duration::from_millis(1000);
const SOURCE: &str = "demo-cpu";
const METRIC: &str = "cpu_utilization";

/// Feeds a gently noisy baseline with an occasional spike into the active
/// detector, forever, until the task is aborted at shutdown.
pub async fn run(engine: Arc<Engine>, clock: Arc<dyn Clock>) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let ctx = DetectionContext::default();
    let mut tick: u64 = 0;

    loop {
        tokio::time::sleep(TICK).await;
        tick += 1;

        let base = 40.0 + 5.0 * (tick as f64 / 30.0).sin();
        let noise: f64 = rng.gen_range(-2.0..2.0);
        let value = if tick % 97 == 0 { base + 45.0 } else { base + noise };

        let sample = Sample::new(SOURCE, METRIC, value, clock.now_ms());
        match engine.detect(&[sample], &ctx).await {
            Ok(anomalies) if !anomalies.is_empty() => {
                for anomaly in anomalies {
                    info!(kind = ?anomaly.kind, score = anomaly.score, "anomaly detected in demo stream");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "demo stream detect failed"),
        }
    }
}
