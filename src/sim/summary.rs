use crate::types::{DistributionSummary, HistogramBin, PathPoint, PathSample};

pub const HISTOGRAM_BINS: usize = 40;

/// One-pass Welford accumulator over terminal prices.
#[derive(Debug, Clone, Copy)]
pub struct TerminalStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for TerminalStats {
    fn default() -> Self {
        Self { count: 0, mean: 0.0, m2: 0.0, min: f64::INFINITY, max: f64::NEG_INFINITY }
    }
}

impl TerminalStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        if x < self.min {
            self.min = x;
        }
        if x > self.max {
            self.max = x;
        }
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample standard deviation (n - 1).
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

/// 40 equal-width bins over [min, max] of the terminals, probabilities as
/// relative frequencies, bin price at the midpoint. The span is inflated
/// by 1e-6 when every terminal is identical.
pub fn build_histogram(terminals: &[f64]) -> Vec<HistogramBin> {
    if terminals.is_empty() {
        return Vec::new();
    }

    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &x in terminals {
        lo = lo.min(x);
        hi = hi.max(x);
    }
    if hi - lo <= 0.0 {
        hi = lo + 1e-6;
    }
    let width = (hi - lo) / HISTOGRAM_BINS as f64;

    let mut counts = [0u32; HISTOGRAM_BINS];
    for &x in terminals {
        let idx = (((x - lo) / width) as usize).min(HISTOGRAM_BINS - 1);
        counts[idx] += 1;
    }

    let n = terminals.len() as f64;
    counts
        .iter()
        .enumerate()
        .map(|(i, &c)| HistogramBin {
            price: lo + (i as f64 + 0.5) * width,
            probability: c as f64 / n,
        })
        .collect()
}

/// Uniform-stride downsample to at most `max_points`, always keeping the
/// first and last point.
pub fn downsample(points: &[PathPoint], max_points: usize) -> PathSample {
    if points.len() <= max_points {
        return points.to_vec();
    }
    let max_points = max_points.max(2);
    let stride = (points.len() - 1).div_ceil(max_points - 1);
    let mut out: PathSample = points.iter().step_by(stride).copied().collect();
    let last = points[points.len() - 1];
    match out.last() {
        Some(p) if p.t_hours == last.t_hours => {}
        _ => out.push(last),
    }
    out
}

pub fn summarize(
    stats: &TerminalStats,
    terminals: &[f64],
    traces: &[Vec<PathPoint>],
    max_points: usize,
) -> DistributionSummary {
    DistributionSummary {
        mean: stats.mean(),
        stddev: stats.stddev(),
        histogram: build_histogram(terminals),
        sample_paths: traces.iter().map(|t| downsample(t, max_points)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_two_pass() {
        let data: Vec<f64> = (0..1000).map(|i| 60_000.0 + (i as f64).sin() * 500.0).collect();
        let mut stats = TerminalStats::new();
        for &x in &data {
            stats.push(x);
        }

        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let var = data.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);

        assert!((stats.mean() - mean).abs() < 1e-9);
        assert!((stats.stddev() - var.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn histogram_mass_closes_to_one() {
        let terminals: Vec<f64> = (0..5000).map(|i| 50_000.0 + i as f64 * 3.7).collect();
        let bins = build_histogram(&terminals);
        assert_eq!(bins.len(), HISTOGRAM_BINS);
        let total: f64 = bins.iter().map(|b| b.probability).sum();
        assert!((total - 1.0).abs() < 1e-9, "total={total}");
    }

    #[test]
    fn degenerate_terminals_still_close() {
        let terminals = vec![60_000.0; 100];
        let bins = build_histogram(&terminals);
        let total: f64 = bins.iter().map(|b| b.probability).sum();
        assert!((total - 1.0).abs() < 1e-9);
        // Everything lands in the first bin of the inflated span.
        assert!((bins[0].probability - 1.0).abs() < 1e-9);
    }

    #[test]
    fn single_terminal_histogram() {
        let bins = build_histogram(&[42.0]);
        let total: f64 = bins.iter().map(|b| b.probability).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn downsample_keeps_endpoints_and_bound() {
        let points: Vec<PathPoint> =
            (0..=180).map(|i| PathPoint { t_hours: i as f64 / 60.0, price: 60_000.0 + i as f64 }).collect();
        let out = downsample(&points, 60);
        assert!(out.len() <= 60, "len={}", out.len());
        assert_eq!(out[0].t_hours, 0.0);
        assert_eq!(out.last().unwrap().t_hours, 3.0);
        for w in out.windows(2) {
            assert!(w[1].t_hours > w[0].t_hours);
        }
    }

    #[test]
    fn downsample_short_series_is_identity() {
        let points: Vec<PathPoint> =
            (0..10).map(|i| PathPoint { t_hours: i as f64, price: i as f64 }).collect();
        assert_eq!(downsample(&points, 60).len(), 10);
    }
}
