use crate::errors::{EngineResult, SimError};
use std::time::Duration;

/// Engine tunables. Everything here has a sane default so the engine can
/// be constructed with `EngineConfig::default()` in tests; `from_env`
/// layers environment overrides on top.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total paths per simulation unless the request overrides it.
    pub default_paths: u32,
    /// Batches per simulation (one progress snapshot per batch).
    pub batches: u32,
    /// Terminal trajectories retained for the distribution summary.
    pub sample_paths: usize,
    /// Max points per retained trajectory after downsampling.
    pub path_points: usize,
    /// Result cache entry cap (insertion-order eviction above this).
    pub cache_capacity: usize,
    /// Result cache per-entry TTL.
    pub cache_ttl: Duration,
    /// Subtract the Merton jump-drift compensator from the diffusion
    /// drift. The live engine historically ran without it.
    pub compensate_jumps: bool,
    /// Run odd paths on the mirrored draw stream of the preceding path.
    pub antithetic: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_paths: 20_000,
            batches: 10,
            sample_paths: 15,
            path_points: 60,
            cache_capacity: 50,
            cache_ttl: Duration::from_secs(60),
            compensate_jumps: false,
            antithetic: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let default_paths = env_var_or("MC_PATHS", "20000")
            .parse::<u32>()
            .map_err(|e| SimError::InvalidInput(format!("MC_PATHS: {e}")))?;

        let batches = env_var_or("MC_BATCHES", "10")
            .parse::<u32>()
            .map_err(|e| SimError::InvalidInput(format!("MC_BATCHES: {e}")))?;

        let sample_paths = env_var_or("MC_SAMPLE_PATHS", "15")
            .parse::<usize>()
            .map_err(|e| SimError::InvalidInput(format!("MC_SAMPLE_PATHS: {e}")))?;

        let path_points = env_var_or("MC_PATH_POINTS", "60")
            .parse::<usize>()
            .map_err(|e| SimError::InvalidInput(format!("MC_PATH_POINTS: {e}")))?;

        let cache_capacity = env_var_or("CACHE_CAPACITY", "50")
            .parse::<usize>()
            .map_err(|e| SimError::InvalidInput(format!("CACHE_CAPACITY: {e}")))?;

        let cache_ttl_secs = env_var_or("CACHE_TTL_SECS", "60")
            .parse::<u64>()
            .map_err(|e| SimError::InvalidInput(format!("CACHE_TTL_SECS: {e}")))?;

        let compensate_jumps = env_var_or("MC_COMPENSATE_JUMPS", "false")
            .parse::<bool>()
            .map_err(|e| SimError::InvalidInput(format!("MC_COMPENSATE_JUMPS: {e}")))?;

        let antithetic = env_var_or("MC_ANTITHETIC", "false")
            .parse::<bool>()
            .map_err(|e| SimError::InvalidInput(format!("MC_ANTITHETIC: {e}")))?;

        if batches == 0 {
            return Err(SimError::InvalidInput("MC_BATCHES must be >= 1".into()));
        }

        Ok(Self {
            default_paths,
            batches,
            sample_paths,
            path_points,
            cache_capacity,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
            compensate_jumps,
            antithetic,
        })
    }
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
