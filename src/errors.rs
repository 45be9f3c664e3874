/// Domain-specific error types for the simulation engine.
/// The engine must:
/// - Reject invalid inputs before any path is drawn
/// - Absorb calibration failures into a degraded default bundle
/// - Short-circuit a job when too many paths diverge numerically
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("calibration input unavailable: {0}")]
    CalibrationUnavailable(String),

    #[error("numerical fault: {faulted} of {requested} paths diverged")]
    NumericalFault { faulted: u32, requested: u32 },

    #[error("cancelled")]
    Cancelled,

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

pub type EngineResult<T> = Result<T, SimError>;
