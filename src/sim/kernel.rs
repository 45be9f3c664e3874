use crate::sim::rng::PathRng;
use crate::types::{JumpKind, JumpParams, PathPoint, RegimeParams, SimInputs};

/// Per-step variance is capped at this sentinel (500% annualized vol)
/// before it reaches the price update, so pathological parameter sets
/// cannot overflow the exponential.
pub const VARIANCE_CAP: f64 = 25.0;

/// Hard guard on the per-step log displacement (a ~20x move).
pub const MAX_STEP_LOG_MOVE: f64 = 3.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct KernelOptions {
    /// Subtract lambda * (E[e^Y] - 1) from the drift.
    pub compensate_jumps: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PathOutcome {
    pub terminal: f64,
    /// Steps whose displacement hit the hard guard.
    pub clamped_steps: u32,
}

/// NaN/Inf surfaced mid-path. The driver redraws the path and counts it.
#[derive(Debug, Clone, Copy)]
pub struct PathFault;

#[inline]
fn regime_params(inputs: &SimInputs, regime: usize) -> &RegimeParams {
    if regime == 0 {
        &inputs.regimes.bull
    } else {
        &inputs.regimes.bear
    }
}

/// Full-truncation Euler step of the variance SDE. The price update reads
/// `v_plus`; the process itself carries `v_next`. Neither is ever
/// negative at the point it is used.
#[inline]
pub(crate) fn variance_step(
    v: f64,
    kappa: f64,
    theta: f64,
    xi: f64,
    dt: f64,
    z_v: f64,
) -> (f64, f64) {
    let v_plus = v.max(0.0);
    let v_next = v + kappa * (theta - v_plus) * dt + xi * (v_plus * dt).sqrt() * z_v;
    (v_plus, v_next.max(0.0))
}

/// One log-jump draw. Merton: N(mu_j, sigma_j^2). Kou: double exponential
/// centered at mu_j with scale sigma_j / sqrt(2) (matched variance).
#[inline]
fn draw_log_jump(rng: &mut PathRng, jumps: &JumpParams) -> f64 {
    match jumps.kind {
        JumpKind::Merton => jumps.mu_j + jumps.sigma_j * rng.normal(),
        JumpKind::Kou => {
            let b = jumps.sigma_j / std::f64::consts::SQRT_2;
            let u = rng.uniform() - 0.5;
            let w = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
            jumps.mu_j - b * u.signum() * w.ln()
        }
    }
}

/// lambda * (E[e^Y] - 1), per unit time.
#[inline]
fn jump_compensator(jumps: &JumpParams) -> f64 {
    let mean_factor = match jumps.kind {
        JumpKind::Merton => (jumps.mu_j + 0.5 * jumps.sigma_j * jumps.sigma_j).exp(),
        JumpKind::Kou => {
            let b = jumps.sigma_j / std::f64::consts::SQRT_2;
            if b >= 1.0 {
                // E[e^Y] diverges; leave the drift alone.
                return 0.0;
            }
            jumps.mu_j.exp() / (1.0 - b * b)
        }
    };
    jumps.lambda * (mean_factor - 1.0)
}

/// Evolve one path to its terminal price.
///
/// Per step: draw correlated shocks, advance the variance under full
/// truncation, diffuse the log price off the pre-update variance, add the
/// compound-Poisson jump sum, then sample the next regime from the
/// transition-matrix row of the current one.
pub fn simulate_path(
    inputs: &SimInputs,
    rng: &mut PathRng,
    opts: &KernelOptions,
    mut trace: Option<&mut Vec<PathPoint>>,
) -> Result<PathOutcome, PathFault> {
    let n = inputs.steps();
    let dt = inputs.dt;

    let mut regime = rng.categorical(&inputs.hmm.pi0);
    let mut x = inputs.s0.ln();
    // Long-run variance of the initial regime as warm start.
    let mut v = regime_params(inputs, regime).heston.theta;
    let mut clamped_steps: u32 = 0;

    if let Some(points) = trace.as_deref_mut() {
        points.clear();
        points.push(PathPoint { t_hours: 0.0, price: inputs.s0 });
    }

    for k in 0..n {
        let rp = regime_params(inputs, regime);
        let hp = rp.heston;

        let (z_s, z_v) = rng.normal_pair(hp.rho);
        let (v_plus, v_next) = variance_step(v, hp.kappa, hp.theta, hp.xi, dt, z_v);

        let v_eff = v_plus.min(VARIANCE_CAP);
        let mut drift = rp.mu - 0.5 * v_eff;
        if opts.compensate_jumps {
            drift -= jump_compensator(&inputs.jumps);
        }
        let mut dx = drift * dt + (v_eff * dt).sqrt() * z_s;

        let jump_count = rng.poisson(inputs.jumps.lambda * dt);
        for _ in 0..jump_count {
            dx += draw_log_jump(rng, &inputs.jumps);
        }

        if dx.abs() > MAX_STEP_LOG_MOVE {
            dx = dx.clamp(-MAX_STEP_LOG_MOVE, MAX_STEP_LOG_MOVE);
            clamped_steps += 1;
        }

        x += dx;
        v = v_next;

        if !x.is_finite() || !v.is_finite() {
            return Err(PathFault);
        }

        if let Some(points) = trace.as_deref_mut() {
            points.push(PathPoint { t_hours: (k + 1) as f64 * dt, price: x.exp() });
        }

        regime = rng.categorical(&inputs.hmm.p[regime]);
    }

    Ok(PathOutcome { terminal: x.exp(), clamped_steps })
}
