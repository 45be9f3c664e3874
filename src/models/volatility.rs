use crate::types::Candle;

/// EWMA decay factor (lambda = 0.94 is standard for short-horizon).
pub const EWMA_LAMBDA: f64 = 0.94;

/// Blend weights for the daily estimate: close-to-close vs Parkinson.
const BLEND_CLOSE: f64 = 0.7;
const BLEND_PARKINSON: f64 = 0.3;

/// Log returns ln(close_i / close_{i-1}) over a candle series.
/// Non-finite ratios (zero or negative closes) are skipped.
pub fn log_returns(candles: &[Candle]) -> Vec<f64> {
    candles
        .windows(2)
        .filter_map(|w| {
            let r = (w[1].close / w[0].close).ln();
            r.is_finite().then_some(r)
        })
        .collect()
}

/// Recursive EWMA volatility: sigma2_0 = r_0^2,
/// sigma2_i = lambda * sigma2_{i-1} + (1 - lambda) * r_i^2.
pub fn ewma_vol(returns: &[f64]) -> f64 {
    let Some((&first, rest)) = returns.split_first() else {
        return 0.0;
    };
    let mut sigma_sq = first * first;
    for &r in rest {
        sigma_sq = EWMA_LAMBDA * sigma_sq + (1.0 - EWMA_LAMBDA) * r * r;
    }
    sigma_sq.sqrt()
}

pub fn mean(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().sum::<f64>() / returns.len() as f64
}

/// Unbiased sample standard deviation (n - 1).
pub fn sample_stddev(returns: &[f64]) -> f64 {
    let n = returns.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(returns);
    let var = returns.iter().map(|r| (r - m) * (r - m)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Parkinson range estimator over a candle series:
/// sqrt((1 / (4 ln2 n)) * sum(ln(high/low)^2)).
pub fn parkinson(candles: &[Candle]) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    let sum: f64 = candles
        .iter()
        .filter_map(|c| {
            let r = (c.high / c.low).ln();
            r.is_finite().then_some(r * r)
        })
        .sum();
    (sum / (4.0 * std::f64::consts::LN_2 * candles.len() as f64)).sqrt()
}

/// Daily RV: 0.7 * close-to-close stddev + 0.3 * Parkinson, both off the
/// hourly bars.
pub fn blended_daily_rv(hourly: &[Candle]) -> f64 {
    let base = sample_stddev(&log_returns(hourly));
    BLEND_CLOSE * base + BLEND_PARKINSON * parkinson(hourly)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle { time_ms: 0, open: close, high: close * 1.001, low: close * 0.999, close, volume: 1.0 }
    }

    #[test]
    fn log_returns_basic() {
        let candles = vec![candle(100.0), candle(110.0), candle(99.0)];
        let rets = log_returns(&candles);
        assert_eq!(rets.len(), 2);
        assert!((rets[0] - (1.1f64).ln()).abs() < 1e-12);
        assert!((rets[1] - (0.9f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn ewma_matches_hand_recursion() {
        let rets = [0.01, -0.02, 0.005, 0.03];
        let mut sigma_sq = rets[0] * rets[0];
        for &r in &rets[1..] {
            sigma_sq = EWMA_LAMBDA * sigma_sq + (1.0 - EWMA_LAMBDA) * r * r;
        }
        assert!((ewma_vol(&rets) - sigma_sq.sqrt()).abs() < 1e-15);
        assert_eq!(ewma_vol(&[]), 0.0);
        assert!((ewma_vol(&[0.02]) - 0.02).abs() < 1e-15);
    }

    #[test]
    fn sample_stddev_is_unbiased_form() {
        let rets = [0.01, 0.03, -0.01, 0.05];
        let m: f64 = rets.iter().sum::<f64>() / 4.0;
        let var: f64 = rets.iter().map(|r| (r - m) * (r - m)).sum::<f64>() / 3.0;
        assert!((sample_stddev(&rets) - var.sqrt()).abs() < 1e-15);
        assert_eq!(sample_stddev(&[0.01]), 0.0);
    }

    #[test]
    fn parkinson_constant_range() {
        // Every bar with high/low = e^0.02 gives exactly
        // sqrt(0.02^2 / (4 ln2)).
        let bars: Vec<Candle> = (0..24)
            .map(|_| Candle {
                time_ms: 0,
                open: 100.0,
                high: 100.0 * (0.01f64).exp(),
                low: 100.0 * (-0.01f64).exp(),
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        let expected = (0.02f64 * 0.02 / (4.0 * std::f64::consts::LN_2)).sqrt();
        assert!((parkinson(&bars) - expected).abs() < 1e-12);
    }

    #[test]
    fn blend_weights() {
        let bars: Vec<Candle> = [100.0, 101.0, 100.5, 102.0, 101.0].map(candle).to_vec();
        let expected = 0.7 * sample_stddev(&log_returns(&bars)) + 0.3 * parkinson(&bars);
        assert!((blended_daily_rv(&bars) - expected).abs() < 1e-15);
    }
}
