use crate::types::{SensitivityOverrides, SimResult};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Canonical key over everything that determines a simulation's result
/// distribution: market, spot to the nearest dollar, time to close to a
/// tenth of an hour, and the sensitivity multipliers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(
        ticker: &str,
        spot: f64,
        hours_to_close: f64,
        sensitivity: &SensitivityOverrides,
    ) -> Self {
        let spot_bucket = spot.round() as i64;
        let ttc_bucket = (hours_to_close * 10.0).round() / 10.0;
        Self(format!(
            "{ticker}|{spot_bucket}|{ttc_bucket:.1}|{:.4}|{:.4}|{:.4}",
            sensitivity.vol_mult, sensitivity.jump_intensity_mult, sensitivity.jump_size_mult
        ))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry {
    result: SimResult,
    inserted: Instant,
}

/// Bounded in-memory store of completed results. Insertion-order
/// eviction above the cap, per-entry TTL, expired entries dropped on
/// touch. Absent and expired read the same: `None`.
pub struct ResultCache {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    pub fn get(&mut self, fingerprint: &Fingerprint) -> Option<SimResult> {
        let key = &fingerprint.0;
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => entry.inserted.elapsed() > self.ttl,
        };
        if expired {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        self.entries.get(key).map(|e| e.result.clone())
    }

    pub fn insert(&mut self, fingerprint: &Fingerprint, result: SimResult) {
        let key = fingerprint.0.clone();
        let fresh = Entry { result, inserted: Instant::now() };
        if self.entries.insert(key.clone(), fresh).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
