//! Monte Carlo settlement-probability engine for BTC binary prediction
//! markets.
//!
//! Paths evolve under Heston stochastic volatility with compound-Poisson
//! jumps and a two-state regime-switching chain; terminal prices are
//! scored against an above-strike or in-range target and converted to a
//! probability, Wilson confidence interval, and fair contract value in
//! cents. Model parameters are calibrated from three granularities of
//! candle history, results are cached under an input fingerprint, and
//! jobs run on a dedicated worker with batched progress events and
//! cooperative cancellation.
//!
//! The engine performs no network I/O. Candles, the live spot, and the
//! market descriptor arrive already parsed; results leave as structured
//! values on the controller's event stream.

pub mod cache;
pub mod config;
pub mod controller;
pub mod errors;
pub mod models;
pub mod pricing;
pub mod sim;
pub mod types;

pub use cache::{Fingerprint, ResultCache};
pub use config::EngineConfig;
pub use controller::JobController;
pub use errors::{EngineResult, SimError};
pub use models::calibration::{build_sim_inputs, calibrate, degraded_default};
pub use pricing::Confidence;
pub use sim::driver::RunConfig;
pub use types::{
    CalibrationData, CancelFlag, Candle, CandleHistory, Diagnostics, DistributionSummary,
    HestonParams, HistogramBin, Hmm, JobEvent, JumpKind, JumpParams, MarketDescriptor, PathPoint,
    PathSample, ProgressUpdate, RegimeEstimate, RegimeLabel, RegimeParams, RegimeSet,
    SensitivityOverrides, SimInputs, SimRequest, SimResult, Target,
};

/// Install a per-process subscriber so engine logs show up under
/// `cargo test` (honors `RUST_LOG`, defaults to info).
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_test_writer()
        .try_init();
}
