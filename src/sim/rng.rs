use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

/// One independent draw stream. Each batch owns its own stream, derived
/// from (base_seed, batch_index) alone, so a batch's result never depends
/// on how many batches ran before it.
#[derive(Debug, Clone)]
pub struct PathRng {
    rng: Xoshiro256PlusPlus,
    /// Negate every normal draw (antithetic partner stream).
    mirror: bool,
}

/// SplitMix64 finalizer. Decorrelates consecutive batch indices before
/// they reach the xoshiro seeder.
#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl PathRng {
    pub fn for_batch(base_seed: u64, batch_index: u32) -> Self {
        let seed = splitmix64(base_seed ^ splitmix64(batch_index as u64));
        Self { rng: Xoshiro256PlusPlus::seed_from_u64(seed), mirror: false }
    }

    /// The antithetic partner of the current stream state: same uniforms,
    /// negated normals.
    pub fn mirrored(&self) -> Self {
        Self { rng: self.rng.clone(), mirror: true }
    }

    /// Uniform draw in [0, 1).
    #[inline]
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Standard normal draw (ziggurat).
    #[inline]
    pub fn normal(&mut self) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        if self.mirror {
            -z
        } else {
            z
        }
    }

    /// Pair of standard normals with correlation `rho`.
    #[inline]
    pub fn normal_pair(&mut self, rho: f64) -> (f64, f64) {
        let z1 = self.normal();
        let z2 = self.normal();
        (z1, rho * z1 + (1.0 - rho * rho).sqrt() * z2)
    }

    /// Poisson draw by Knuth's product method. Intended for means well
    /// below 30 (per-step jump counts are << 1).
    pub fn poisson(&mut self, mean: f64) -> u32 {
        if mean <= 0.0 || !mean.is_finite() {
            return 0;
        }
        let limit = (-mean).exp();
        let mut k: u32 = 0;
        let mut product = 1.0;
        loop {
            product *= self.uniform();
            if product <= limit {
                return k;
            }
            k += 1;
            // Unreachable for sane means; bounds the loop anyway.
            if k >= 10_000 {
                return k;
            }
        }
    }

    /// Index draw from unnormalized non-negative weights.
    pub fn categorical(&mut self, weights: &[f64]) -> usize {
        let total: f64 = weights.iter().sum();
        if total <= 0.0 || !total.is_finite() || weights.is_empty() {
            return 0;
        }
        let u = self.uniform() * total;
        let mut acc = 0.0;
        for (i, &w) in weights.iter().enumerate() {
            acc += w;
            if u < acc {
                return i;
            }
        }
        weights.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_streams_are_deterministic_and_independent() {
        let mut a = PathRng::for_batch(42, 3);
        let mut b = PathRng::for_batch(42, 3);
        let mut c = PathRng::for_batch(42, 4);

        let da: Vec<f64> = (0..16).map(|_| a.uniform()).collect();
        let db: Vec<f64> = (0..16).map(|_| b.uniform()).collect();
        let dc: Vec<f64> = (0..16).map(|_| c.uniform()).collect();

        assert_eq!(da, db);
        assert_ne!(da, dc);
    }

    #[test]
    fn uniform_stays_in_unit_interval() {
        let mut rng = PathRng::for_batch(7, 0);
        for _ in 0..10_000 {
            let u = rng.uniform();
            assert!((0.0..1.0).contains(&u), "uniform out of range: {u}");
        }
    }

    #[test]
    fn normal_moments() {
        let mut rng = PathRng::for_batch(11, 0);
        let n = 100_000;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for _ in 0..n {
            let z = rng.normal();
            sum += z;
            sum_sq += z * z;
        }
        let mean = sum / n as f64;
        let var = sum_sq / n as f64 - mean * mean;
        assert!(mean.abs() < 0.02, "mean={mean}");
        assert!((var - 1.0).abs() < 0.03, "var={var}");
    }

    #[test]
    fn normal_pair_correlation() {
        let rho = -0.5;
        let mut rng = PathRng::for_batch(13, 0);
        let n = 100_000;
        let mut sum_xy = 0.0;
        for _ in 0..n {
            let (z1, z2) = rng.normal_pair(rho);
            sum_xy += z1 * z2;
        }
        let corr = sum_xy / n as f64;
        assert!((corr - rho).abs() < 0.02, "corr={corr}");
    }

    #[test]
    fn poisson_mean_matches() {
        let mut rng = PathRng::for_batch(17, 0);
        let mean = 2.0;
        let n = 50_000;
        let total: u64 = (0..n).map(|_| rng.poisson(mean) as u64).sum();
        let sample_mean = total as f64 / n as f64;
        assert!((sample_mean - mean).abs() < 0.05, "sample_mean={sample_mean}");
        assert_eq!(rng.poisson(0.0), 0);
        assert_eq!(rng.poisson(-1.0), 0);
    }

    #[test]
    fn categorical_respects_weights() {
        let mut rng = PathRng::for_batch(19, 0);
        let weights = [0.2, 0.5, 0.3];
        let mut counts = [0u32; 3];
        let n = 100_000;
        for _ in 0..n {
            counts[rng.categorical(&weights)] += 1;
        }
        for (i, &w) in weights.iter().enumerate() {
            let freq = counts[i] as f64 / n as f64;
            assert!((freq - w).abs() < 0.01, "bucket {i}: freq={freq} want {w}");
        }
        // Degenerate rows pick the certain state.
        assert_eq!(rng.categorical(&[1.0, 0.0]), 0);
        assert_eq!(rng.categorical(&[0.0, 1.0]), 1);
    }

    #[test]
    fn mirrored_stream_negates_normals_only() {
        let base = PathRng::for_batch(23, 0);
        let mut a = base.clone();
        let mut b = base.mirrored();
        for _ in 0..64 {
            assert_eq!(a.normal(), -b.normal());
        }
        let mut a = base.clone();
        let mut b = base.mirrored();
        for _ in 0..64 {
            assert_eq!(a.uniform(), b.uniform());
        }
    }
}
