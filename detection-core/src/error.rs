use thiserror::Error;

/// Errors surfaced by the detection core.
///
/// Variants correspond to the error kinds named in the system design: each
/// one is either fatal (caller must stop) or recoverable (the engine logs and
/// keeps serving other sources/detectors). See individual variant docs.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Missing required field, unknown detector name, invalid threshold range.
    /// Surfaced to the caller; causes no state mutation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `Train` called with fewer than `minDataPoints` samples. The detector
    /// remains `ready = false`.
    #[error("insufficient training data: have {have}, need at least {need}")]
    InsufficientData { have: usize, need: usize },

    /// A single transformation failed; the record still progresses through
    /// the rest of the pipeline with that transformation skipped.
    #[error("transformation '{0}' failed: {1}")]
    Transformation(String, String),

    /// A child detector inside a composite failed; it contributes zero to
    /// the ensemble and the remaining children still get combined.
    #[error("detector '{0}' failed: {1}")]
    DetectorFailure(String, String),

    /// A notification transport returned an error. Recorded on the
    /// notification record; never fails the owning alert.
    #[error("notification delivery on channel '{0}' failed: {1}")]
    NotificationFailure(String, String),

    /// A business/suppression/derivation expression failed to parse or
    /// evaluate. The rule is treated as non-matching (fail-safe).
    #[error("expression '{0}' is invalid: {1}")]
    ExpressionEvaluation(String, String),

    /// Engine initialization referenced a detector name that isn't
    /// registered. This is the one fatal condition in the design; callers
    /// should treat it as a halt.
    #[error("unknown detector type: {0}")]
    UnknownDetectorType(String),

    /// A named entity (source, alert, rule) was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Generic invalid-state condition (e.g. transition attempted on a
    /// closed alert).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Wraps this error with the name of the subsystem that observed it,
    /// per the propagation policy: errors crossing subsystem boundaries are
    /// tagged with the subsystem name.
    pub fn in_subsystem(self, subsystem: &str) -> Self {
        match self {
            CoreError::Configuration(msg) => {
                CoreError::Configuration(format!("[{subsystem}] {msg}"))
            }
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
