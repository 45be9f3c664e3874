use crate::errors::{EngineResult, SimError};
use portable_atomic::{AtomicBool, Ordering};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ── Model parameter bundles ──

/// Heston stochastic-variance parameters. The Feller condition
/// (2*kappa*theta >= xi^2) is not required; the kernel clamps variance
/// at zero when it is violated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HestonParams {
    /// Mean-reversion speed.
    pub kappa: f64,
    /// Long-run variance.
    pub theta: f64,
    /// Vol of vol.
    pub xi: f64,
    /// Price/variance shock correlation.
    pub rho: f64,
}

impl HestonParams {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.kappa.is_finite() || self.kappa <= 0.0 {
            return Err(SimError::InvalidInput(format!("kappa must be > 0, got {}", self.kappa)));
        }
        if !self.theta.is_finite() || self.theta <= 0.0 {
            return Err(SimError::InvalidInput(format!("theta must be > 0, got {}", self.theta)));
        }
        if !self.xi.is_finite() || self.xi <= 0.0 {
            return Err(SimError::InvalidInput(format!("xi must be > 0, got {}", self.xi)));
        }
        if !self.rho.is_finite() || !(-1.0..=1.0).contains(&self.rho) {
            return Err(SimError::InvalidInput(format!("rho must be in [-1, 1], got {}", self.rho)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpKind {
    Merton,
    Kou,
}

/// Compound-Poisson jump component. `lambda` is the rate per hour.
/// For `merton` the log jump size is N(mu_j, sigma_j^2); for `kou` it is
/// a double exponential centered at mu_j with matched variance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JumpParams {
    pub lambda: f64,
    pub mu_j: f64,
    pub sigma_j: f64,
    pub kind: JumpKind,
}

impl JumpParams {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.lambda.is_finite() || self.lambda < 0.0 {
            return Err(SimError::InvalidInput(format!("lambda must be >= 0, got {}", self.lambda)));
        }
        if !self.mu_j.is_finite() {
            return Err(SimError::InvalidInput("mu_j must be finite".into()));
        }
        if !self.sigma_j.is_finite() || self.sigma_j < 0.0 {
            return Err(SimError::InvalidInput(format!("sigma_j must be >= 0, got {}", self.sigma_j)));
        }
        Ok(())
    }
}

/// Per-regime dynamics: an hourly log-drift rate plus a Heston bundle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeParams {
    pub mu: f64,
    pub heston: HestonParams,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeSet {
    #[serde(rename = "BULL")]
    pub bull: RegimeParams,
    #[serde(rename = "BEAR")]
    pub bear: RegimeParams,
}

/// Two-state hidden Markov chain. `p` is the per-step transition matrix
/// (row-stochastic), `pi0` the initial distribution over [bull, bear].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Hmm {
    pub p: [[f64; 2]; 2],
    pub pi0: [f64; 2],
}

impl Hmm {
    pub fn validate(&self) -> EngineResult<()> {
        for (i, row) in self.p.iter().enumerate() {
            for &v in row {
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    return Err(SimError::InvalidInput(format!(
                        "transition matrix entry out of [0, 1] in row {i}: {v}"
                    )));
                }
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > 1e-9 {
                return Err(SimError::InvalidInput(format!(
                    "transition matrix row {i} sums to {sum}, expected 1"
                )));
            }
        }
        for &v in &self.pi0 {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(SimError::InvalidInput(format!("pi0 entry out of [0, 1]: {v}")));
            }
        }
        let sum: f64 = self.pi0.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(SimError::InvalidInput(format!("pi0 sums to {sum}, expected 1")));
        }
        Ok(())
    }
}

/// Everything the path kernel needs. Immutable once validated.
/// Times are in hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimInputs {
    pub s0: f64,
    pub t: f64,
    pub dt: f64,
    pub regimes: RegimeSet,
    pub hmm: Hmm,
    pub jumps: JumpParams,
}

impl SimInputs {
    /// Number of kernel steps: round(t / dt).
    #[inline]
    pub fn steps(&self) -> usize {
        (self.t / self.dt).round() as usize
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.s0.is_finite() || self.s0 <= 0.0 {
            return Err(SimError::InvalidInput(format!("s0 must be > 0, got {}", self.s0)));
        }
        if !self.t.is_finite() || self.t <= 0.0 {
            return Err(SimError::InvalidInput(format!("t must be > 0, got {}", self.t)));
        }
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(SimError::InvalidInput(format!("dt must be > 0, got {}", self.dt)));
        }
        if self.steps() < 1 {
            return Err(SimError::InvalidInput(format!(
                "t/dt must round to at least one step, got t={} dt={}",
                self.t, self.dt
            )));
        }
        if !self.regimes.bull.mu.is_finite() || !self.regimes.bear.mu.is_finite() {
            return Err(SimError::InvalidInput("regime drift must be finite".into()));
        }
        self.regimes.bull.heston.validate()?;
        self.regimes.bear.heston.validate()?;
        self.hmm.validate()?;
        self.jumps.validate()?;
        Ok(())
    }
}

// ── Targets ──

/// Settlement region for a binary contract. Range bounds are inclusive
/// on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Above { k: f64 },
    Range { l: f64, u: f64 },
}

impl Target {
    /// Pure hit test on a terminal price.
    #[inline]
    pub fn is_hit(&self, terminal: f64) -> bool {
        match *self {
            Target::Above { k } => terminal >= k,
            Target::Range { l, u } => terminal >= l && terminal <= u,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match *self {
            Target::Above { k } => {
                if !k.is_finite() || k <= 0.0 {
                    return Err(SimError::InvalidInput(format!("strike must be > 0, got {k}")));
                }
            }
            Target::Range { l, u } => {
                if !l.is_finite() || !u.is_finite() || l <= 0.0 || l >= u {
                    return Err(SimError::InvalidInput(format!(
                        "range bounds must satisfy 0 < L < U, got L={l} U={u}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Results ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PathPoint {
    pub t_hours: f64,
    pub price: f64,
}

/// One retained trajectory, monotone in time, starting at (0, s0).
pub type PathSample = Vec<PathPoint>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistogramBin {
    /// Bin midpoint.
    pub price: f64,
    /// Relative frequency; bins sum to 1.
    pub probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionSummary {
    pub mean: f64,
    pub stddev: f64,
    pub histogram: Vec<HistogramBin>,
    pub sample_paths: Vec<PathSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    pub stderr: f64,
    pub n: u32,
    /// Running p-hat after each batch.
    pub convergence: Option<Vec<f64>>,
    /// Paths aborted on NaN/Inf and redrawn.
    pub faulted_paths: u32,
    /// Steps whose log displacement hit the hard guard.
    pub clamped_steps: u64,
    /// Whether the Merton jump-drift compensator was subtracted.
    pub compensated_drift: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimResult {
    pub target: Target,
    pub p: f64,
    pub ci: [f64; 2],
    /// Fair contract value in cents.
    pub fair: u8,
    pub diagnostics: Diagnostics,
    pub distribution: Option<DistributionSummary>,
}

/// Emitted after every completed batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub batch: u32,
    pub batches: u32,
    pub cumulative_n: u32,
    pub cumulative_hits: u32,
    pub running_p: f64,
    pub running_ci: [f64; 2],
}

// ── Calibration ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegimeLabel {
    Bull,
    Bear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeEstimate {
    pub current: RegimeLabel,
    /// [bull, bear] scores, summing to 1.
    pub probabilities: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationData {
    pub daily_rv: f64,
    pub weekly_rv: f64,
    pub intraday_rv: f64,
    pub jumps: JumpParams,
    pub regime: RegimeEstimate,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// True when upstream candles were unusable and the documented
    /// default bundle was substituted.
    pub degraded: bool,
}

// ── Calibrator inputs ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_sane(&self) -> bool {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        self.low > 0.0
            && self.low <= body_lo
            && body_hi <= self.high
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
    }
}

/// The three granularities the calibrator consumes: nominally 60 s x 60,
/// 3600 s x 24, 86400 s x 7.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandleHistory {
    pub minute: Vec<Candle>,
    pub hourly: Vec<Candle>,
    pub daily: Vec<Candle>,
}

// ── Market boundary ──

/// Parsed market descriptor handed in by the (external) market client.
/// Exactly one of `strike_price` or the range pair must be populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDescriptor {
    pub ticker: String,
    /// ISO-8601 close time.
    pub close_time: String,
    pub strike_price: Option<f64>,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
}

impl MarketDescriptor {
    pub fn target(&self) -> EngineResult<Target> {
        let target = match (self.strike_price, self.range_low, self.range_high) {
            (Some(k), None, None) => Target::Above { k },
            (None, Some(l), Some(u)) => Target::Range { l, u },
            _ => {
                return Err(SimError::InvalidInput(format!(
                    "market {} must carry exactly one of strike_price or (range_low, range_high)",
                    self.ticker
                )))
            }
        };
        target.validate()?;
        Ok(target)
    }

    /// Hours until close, floored at zero. Accepts RFC 3339 and the bare
    /// `%Y-%m-%dT%H:%M:%SZ` form some market APIs emit.
    pub fn hours_to_close(&self, now: chrono::DateTime<chrono::Utc>) -> f64 {
        chrono::DateTime::parse_from_rfc3339(&self.close_time)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc) - now)
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(&self.close_time, "%Y-%m-%dT%H:%M:%SZ")
                    .ok()
                    .map(|dt| dt.and_utc() - now)
            })
            .map(|d| d.num_milliseconds() as f64 / 3_600_000.0)
            .unwrap_or(0.0)
            .max(0.0)
    }
}

/// What-if multipliers applied on top of calibration. All in [0.9, 1.1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensitivityOverrides {
    pub vol_mult: f64,
    pub jump_intensity_mult: f64,
    pub jump_size_mult: f64,
}

impl Default for SensitivityOverrides {
    fn default() -> Self {
        Self { vol_mult: 1.0, jump_intensity_mult: 1.0, jump_size_mult: 1.0 }
    }
}

impl SensitivityOverrides {
    pub fn validate(&self) -> EngineResult<()> {
        for (name, v) in [
            ("vol_mult", self.vol_mult),
            ("jump_intensity_mult", self.jump_intensity_mult),
            ("jump_size_mult", self.jump_size_mult),
        ] {
            if !v.is_finite() || !(0.9..=1.1).contains(&v) {
                return Err(SimError::InvalidInput(format!("{name} must be in [0.9, 1.1], got {v}")));
            }
        }
        Ok(())
    }
}

// ── Job protocol ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimRequest {
    pub market: MarketDescriptor,
    pub spot: f64,
    pub calibration: CalibrationData,
    pub sensitivity: SensitivityOverrides,
    /// Total paths; falls back to the engine default when absent.
    pub n_paths: Option<u32>,
    /// Reproducibility seed; wall-clock nanoseconds when absent.
    pub base_seed: Option<u64>,
    pub capture_distribution: bool,
}

/// Messages OUT of the worker, in emission order: zero or more Progress,
/// then exactly one terminal variant.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress { job_id: Uuid, update: ProgressUpdate },
    Complete { job_id: Uuid, result: SimResult },
    Cancelled { job_id: Uuid },
    Error { job_id: Uuid, message: String },
}

// ── Cancellation ──

/// Cooperative cancellation token shared between the controller and the
/// worker. The only mutable state they share besides the cache.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
