use crate::config::EngineConfig;
use crate::errors::{EngineResult, SimError};
use crate::pricing::{self, Confidence};
use crate::sim::kernel::{self, KernelOptions};
use crate::sim::rng::PathRng;
use crate::sim::summary::{self, TerminalStats};
use crate::types::{
    CancelFlag, Diagnostics, PathPoint, ProgressUpdate, SimInputs, SimResult, Target,
};
use smallvec::SmallVec;

/// Per-run knobs, resolved from the engine config plus the request.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub n_paths: u32,
    pub batches: u32,
    pub base_seed: u64,
    pub sample_paths: usize,
    pub path_points: usize,
    pub capture_distribution: bool,
    pub compensate_jumps: bool,
    pub antithetic: bool,
    pub confidence: Confidence,
}

impl RunConfig {
    pub fn from_engine(
        cfg: &EngineConfig,
        n_paths: u32,
        base_seed: u64,
        capture_distribution: bool,
    ) -> Self {
        Self {
            n_paths,
            batches: cfg.batches,
            base_seed,
            sample_paths: cfg.sample_paths,
            path_points: cfg.path_points,
            capture_distribution,
            compensate_jumps: cfg.compensate_jumps,
            antithetic: cfg.antithetic,
            confidence: Confidence::P95,
        }
    }
}

/// Run `n_paths` through the kernel in `batches` batches, emitting one
/// progress snapshot per batch and a final priced result.
///
/// Each batch owns a stream seeded from (base_seed, batch_index) only, so
/// the result is bit-exact for a fixed (inputs, target, config). The
/// cancellation flag is honored between batches; a cancelled run produces
/// nothing.
pub fn run(
    inputs: &SimInputs,
    target: &Target,
    cfg: &RunConfig,
    cancel: &CancelFlag,
    mut on_progress: impl FnMut(ProgressUpdate),
) -> EngineResult<SimResult> {
    inputs.validate()?;
    target.validate()?;
    if cfg.n_paths == 0 {
        return Err(SimError::InvalidInput("n_paths must be >= 1".into()));
    }
    if cfg.batches == 0 {
        return Err(SimError::InvalidInput("batches must be >= 1".into()));
    }

    let opts = KernelOptions { compensate_jumps: cfg.compensate_jumps };
    let batch_size = cfg.n_paths.div_ceil(cfg.batches);
    // Faults are tolerated up to 1% of the requested paths.
    let fault_budget = cfg.n_paths / 100;

    let mut hits: u32 = 0;
    let mut done: u32 = 0;
    let mut faulted: u32 = 0;
    let mut clamped_steps: u64 = 0;
    let mut stats = TerminalStats::new();
    let mut terminals: Vec<f64> = if cfg.capture_distribution {
        Vec::with_capacity(cfg.n_paths as usize)
    } else {
        Vec::new()
    };
    let mut traces: SmallVec<[Vec<PathPoint>; 16]> = SmallVec::new();
    let mut convergence: Vec<f64> = Vec::with_capacity(cfg.batches as usize);

    for batch in 0..cfg.batches {
        if cancel.is_cancelled() {
            tracing::info!(batch, done, "simulation cancelled between batches");
            return Err(SimError::Cancelled);
        }

        let remaining = cfg.n_paths - done;
        let batch_n = remaining.min(batch_size);

        let mut rng = PathRng::for_batch(cfg.base_seed, batch);
        let mut pending_mirror: Option<PathRng> = None;

        for _ in 0..batch_n {
            let retain_trace =
                cfg.capture_distribution && traces.len() < cfg.sample_paths;
            let mut trace: Vec<PathPoint> = Vec::new();

            let outcome = loop {
                // Antithetic mode replays the previous path's uniforms
                // with negated normals; faulted paths always redraw fresh.
                let attempt = if let Some(mut mirror) = pending_mirror.take() {
                    kernel::simulate_path(
                        inputs,
                        &mut mirror,
                        &opts,
                        retain_trace.then_some(&mut trace),
                    )
                } else {
                    if cfg.antithetic {
                        pending_mirror = Some(rng.mirrored());
                    }
                    kernel::simulate_path(
                        inputs,
                        &mut rng,
                        &opts,
                        retain_trace.then_some(&mut trace),
                    )
                };

                match attempt {
                    Ok(outcome) => break outcome,
                    Err(kernel::PathFault) => {
                        faulted += 1;
                        pending_mirror = None;
                        if faulted > fault_budget {
                            tracing::warn!(faulted, requested = cfg.n_paths, "fault budget exceeded");
                            return Err(SimError::NumericalFault {
                                faulted,
                                requested: cfg.n_paths,
                            });
                        }
                    }
                }
            };

            clamped_steps += outcome.clamped_steps as u64;
            if target.is_hit(outcome.terminal) {
                hits += 1;
            }
            stats.push(outcome.terminal);
            if cfg.capture_distribution {
                terminals.push(outcome.terminal);
            }
            if retain_trace {
                traces.push(trace);
            }
        }

        done += batch_n;
        let running_p = pricing::p_hat(hits, done);
        let running_ci = pricing::wilson_ci(hits, done, cfg.confidence);
        convergence.push(running_p);

        tracing::debug!(
            batch = batch + 1,
            batches = cfg.batches,
            cumulative_n = done,
            running_p,
            "batch complete"
        );

        on_progress(ProgressUpdate {
            batch: batch + 1,
            batches: cfg.batches,
            cumulative_n: done,
            cumulative_hits: hits,
            running_p,
            running_ci,
        });
    }

    let p = pricing::p_hat(hits, done);
    let distribution = cfg
        .capture_distribution
        .then(|| summary::summarize(&stats, &terminals, &traces, cfg.path_points));

    Ok(SimResult {
        target: *target,
        p,
        ci: pricing::wilson_ci(hits, done, cfg.confidence),
        fair: pricing::fair_cents(p),
        diagnostics: Diagnostics {
            stderr: pricing::binomial_stderr(p, done),
            n: done,
            convergence: Some(convergence),
            faulted_paths: faulted,
            clamped_steps,
            compensated_drift: cfg.compensate_jumps,
        },
        distribution,
    })
}
