//! Online mean/variance accumulation via Welford's algorithm
//!
//! Mirrors the single-statement profile upsert in the store so the in-memory
//! and persisted forms agree to float precision:
//!
//! ```text
//! count' = count + 1
//! mean'  = mean + (x − mean) / count'
//! m2'    = m2 + (x − mean) · (x − mean')
//! ```

use serde::{Deserialize, Serialize};

/// Numerically stable running mean/variance accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WelfordAccumulator {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the running mean
    pub m2: f64,
}

impl WelfordAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an accumulator from persisted state
    pub fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        Self { count, mean, m2 }
    }

    /// Fold one observation into the running statistics
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    /// Sample variance: `m2 / (count − 1)`, 0 when fewer than two observations
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Standard error of the mean
    pub fn stderr(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.stddev() / (self.count as f64).sqrt()
        }
    }

    /// Combine two accumulators (Chan's parallel formula)
    pub fn merge(&self, other: &WelfordAccumulator) -> WelfordAccumulator {
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.count as f64 / count as f64;
        let m2 = self.m2
            + other.m2
            + delta * delta * (self.count as f64 * other.count as f64) / count as f64;
        WelfordAccumulator { count, mean, m2 }
    }
}
