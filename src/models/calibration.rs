use crate::errors::{EngineResult, SimError};
use crate::models::volatility::{self, blended_daily_rv, ewma_vol, log_returns, sample_stddev};
use crate::types::{
    CalibrationData, Candle, CandleHistory, HestonParams, Hmm, JumpKind, JumpParams,
    RegimeEstimate, RegimeLabel, RegimeParams, RegimeSet, SensitivityOverrides, SimInputs,
};

/// Kernel step size: one minute, in hours.
pub const DT_HOURS: f64 = 1.0 / 60.0;

/// Returns further than this many sigmas from the mean are jumps.
const JUMP_THRESHOLD: f64 = 3.0;

const LAMBDA_MIN: f64 = 0.01;
const LAMBDA_MAX: f64 = 1.0;
const SIGMA_J_MIN: f64 = 0.01;
const SIGMA_J_MAX: f64 = 0.1;

const THETA_MIN: f64 = 1e-4;
const THETA_MAX: f64 = 0.25;
const XI_MIN: f64 = 0.1;
const XI_MAX: f64 = 1.0;
const RHO: f64 = -0.5;

/// Regime classifier window over minute returns.
const REGIME_WINDOW: usize = 20;
const REGIME_MIN_RETURNS: usize = 10;

/// Hourly drift magnitude as a fraction of daily RV.
const DRIFT_FRACTION: f64 = 0.1;
/// Bear long-run variance inflation over the calibrated theta.
const BEAR_THETA_INFLATION: f64 = 1.3;
/// Per-step probability of staying in the current regime.
const REGIME_STICKINESS: f64 = 0.95;

/// RV substituted when upstream candles are unusable (annualizes to the
/// documented default theta of 0.04).
const DEGRADED_RV: f64 = 0.2;

pub fn default_jumps() -> JumpParams {
    JumpParams { lambda: 0.1, mu_j: 0.0, sigma_j: 0.02, kind: JumpKind::Merton }
}

/// The documented fallback bundle, flagged degraded.
pub fn degraded_default(now: chrono::DateTime<chrono::Utc>) -> CalibrationData {
    CalibrationData {
        daily_rv: DEGRADED_RV,
        weekly_rv: DEGRADED_RV,
        intraday_rv: DEGRADED_RV,
        jumps: default_jumps(),
        regime: RegimeEstimate { current: RegimeLabel::Bull, probabilities: [0.5, 0.5] },
        timestamp: now,
        degraded: true,
    }
}

/// Calibrate from the three candle series. Never fails: unusable input
/// degrades to the documented default bundle.
pub fn calibrate(history: &CandleHistory, now: chrono::DateTime<chrono::Utc>) -> CalibrationData {
    match try_calibrate(history, now) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(error = %e, "calibration degraded to default bundle");
            degraded_default(now)
        }
    }
}

fn try_calibrate(
    history: &CandleHistory,
    now: chrono::DateTime<chrono::Utc>,
) -> EngineResult<CalibrationData> {
    validate_series("minute", &history.minute)?;
    validate_series("hourly", &history.hourly)?;
    validate_series("daily", &history.daily)?;

    let minute_returns = log_returns(&history.minute);
    if minute_returns.len() < 2 {
        return Err(SimError::CalibrationUnavailable("too few minute returns".into()));
    }

    let intraday_rv = ewma_vol(&minute_returns);
    let daily_rv = blended_daily_rv(&history.hourly);
    let weekly_rv = sample_stddev(&log_returns(&history.daily));

    if daily_rv <= 0.0 || !daily_rv.is_finite() {
        return Err(SimError::CalibrationUnavailable("flat hourly series".into()));
    }

    Ok(CalibrationData {
        daily_rv,
        weekly_rv,
        intraday_rv,
        jumps: estimate_jumps(&minute_returns),
        regime: classify_regime(&minute_returns),
        timestamp: now,
        degraded: false,
    })
}

fn validate_series(name: &str, candles: &[Candle]) -> EngineResult<()> {
    if candles.len() < 2 {
        return Err(SimError::CalibrationUnavailable(format!(
            "{name} series has {} candles, need at least 2",
            candles.len()
        )));
    }
    for w in candles.windows(2) {
        if w[1].time_ms <= w[0].time_ms {
            return Err(SimError::CalibrationUnavailable(format!(
                "{name} series timestamps not increasing at {}",
                w[1].time_ms
            )));
        }
    }
    if let Some(bad) = candles.iter().find(|c| !c.is_sane()) {
        return Err(SimError::CalibrationUnavailable(format!(
            "{name} series has malformed candle at {}",
            bad.time_ms
        )));
    }
    Ok(())
}

/// Flag returns more than 3 sigma from the mean, then fit a symmetric
/// Merton bundle to the flagged set. No flags means the default bundle.
fn estimate_jumps(minute_returns: &[f64]) -> JumpParams {
    let m = volatility::mean(minute_returns);
    let s = sample_stddev(minute_returns);
    if s <= 0.0 {
        return default_jumps();
    }

    let flagged: Vec<f64> = minute_returns
        .iter()
        .copied()
        .filter(|r| (r - m).abs() > JUMP_THRESHOLD * s)
        .collect();
    if flagged.is_empty() {
        return default_jumps();
    }

    let lambda = (flagged.len() as f64 / minute_returns.len() as f64).clamp(LAMBDA_MIN, LAMBDA_MAX);
    let log_magnitudes: Vec<f64> =
        flagged.iter().map(|r| r.abs().ln()).filter(|v| v.is_finite()).collect();
    let sigma_j = sample_stddev(&log_magnitudes).clamp(SIGMA_J_MIN, SIGMA_J_MAX);

    // Symmetric by construction; direction comes from the diffusion.
    JumpParams { lambda, mu_j: 0.0, sigma_j, kind: JumpKind::Merton }
}

/// Heuristic two-state classifier over the trailing minute returns.
fn classify_regime(minute_returns: &[f64]) -> RegimeEstimate {
    if minute_returns.len() < REGIME_MIN_RETURNS {
        return RegimeEstimate { current: RegimeLabel::Bull, probabilities: [0.5, 0.5] };
    }

    let start = minute_returns.len().saturating_sub(REGIME_WINDOW);
    let window = &minute_returns[start..];
    let m = volatility::mean(window);
    let sigma = sample_stddev(window);

    let bull_score = (if m > 0.0 { 0.6 } else { 0.4 }) + (if sigma < 0.02 { 0.2 } else { 0.0 });
    let bear_score = 1.0 - bull_score;
    let current = if bull_score >= bear_score { RegimeLabel::Bull } else { RegimeLabel::Bear };

    RegimeEstimate { current, probabilities: [bull_score, bear_score] }
}

#[inline]
fn theta_blend(daily_rv: f64, weekly_rv: f64) -> f64 {
    (0.7 * daily_rv * daily_rv + 0.3 * weekly_rv * weekly_rv).clamp(THETA_MIN, THETA_MAX)
}

/// Heston bundle from the three realized-volatility estimates.
pub fn heston_from_rvs(daily_rv: f64, weekly_rv: f64, intraday_rv: f64) -> HestonParams {
    let gap = (intraday_rv - daily_rv).abs();
    let kappa = (if gap > 0.01 { 3.0 } else { 2.0f64 }).clamp(0.5, 5.0);
    let xi = (gap / daily_rv.max(1e-12)).clamp(XI_MIN, XI_MAX);
    HestonParams { kappa, theta: theta_blend(daily_rv, weekly_rv), xi, rho: RHO }
}

/// Assemble the full simulation input bundle for a market `t_hours` from
/// close, with sensitivity multipliers applied: `vol_mult` scales the
/// daily RV feeding theta, the jump multipliers scale lambda and sigma_j.
pub fn build_sim_inputs(
    calibration: &CalibrationData,
    spot: f64,
    t_hours: f64,
    sensitivity: &SensitivityOverrides,
) -> EngineResult<SimInputs> {
    sensitivity.validate()?;

    let daily_eff = calibration.daily_rv * sensitivity.vol_mult;
    let heston = if calibration.degraded {
        HestonParams {
            kappa: 2.0,
            theta: theta_blend(daily_eff, DEGRADED_RV),
            xi: 0.3,
            rho: RHO,
        }
    } else {
        let mut hp =
            heston_from_rvs(calibration.daily_rv, calibration.weekly_rv, calibration.intraday_rv);
        hp.theta = theta_blend(daily_eff, calibration.weekly_rv);
        hp
    };

    let bear_heston = HestonParams {
        theta: (heston.theta * BEAR_THETA_INFLATION).clamp(THETA_MIN, THETA_MAX),
        ..heston
    };
    let drift = DRIFT_FRACTION * daily_eff;

    let jumps = JumpParams {
        lambda: calibration.jumps.lambda * sensitivity.jump_intensity_mult,
        mu_j: calibration.jumps.mu_j,
        sigma_j: calibration.jumps.sigma_j * sensitivity.jump_size_mult,
        kind: calibration.jumps.kind,
    };

    let inputs = SimInputs {
        s0: spot,
        t: t_hours,
        dt: DT_HOURS,
        regimes: RegimeSet {
            bull: RegimeParams { mu: drift, heston },
            bear: RegimeParams { mu: -drift, heston: bear_heston },
        },
        hmm: Hmm {
            p: [
                [REGIME_STICKINESS, 1.0 - REGIME_STICKINESS],
                [1.0 - REGIME_STICKINESS, REGIME_STICKINESS],
            ],
            pi0: calibration.regime.probabilities,
        },
        jumps,
    };
    inputs.validate()?;
    Ok(inputs)
}
