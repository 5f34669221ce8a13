//! Minimal metric primitives for components that surface counters and
//! latency distributions without an exporter dependency.

use serde::{Deserialize, Serialize};

/// Fixed-bucket histogram that also keeps a bounded window of recent raw
/// samples for quantile estimation.
#[derive(Debug, Clone)]
pub struct Histogram {
    bucket_bounds: Vec<f64>,
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
    recent: Vec<f64>,
    max_recent: usize,
}

/// Serializable view of a histogram with derived percentiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Upper bounds of each bucket.
    pub bucket_bounds: Vec<f64>,
    /// Observations per bucket (final bucket is the overflow).
    pub bucket_counts: Vec<u64>,
    /// Total observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// 50th percentile over the recent window.
    pub p50: f64,
    /// 90th percentile over the recent window.
    pub p90: f64,
    /// 95th percentile over the recent window.
    pub p95: f64,
    /// 99th percentile over the recent window.
    pub p99: f64,
}

impl Histogram {
    /// Build a histogram with the given ascending bucket bounds.
    #[must_use]
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bucket_bounds: bounds.to_vec(),
            bucket_counts: vec![0; bounds.len() + 1],
            count: 0,
            sum: 0.0,
            recent: Vec::new(),
            max_recent: 100,
        }
    }

    /// Record one observation.
    pub fn observe(&mut self, value: f64) {
        let idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());
        self.bucket_counts[idx] += 1;
        self.count += 1;
        self.sum += value;
        self.recent.push(value);
        if self.recent.len() > self.max_recent {
            self.recent.remove(0);
        }
    }

    /// Total observations.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Quantile over the recent sample window (0 when empty).
    #[must_use]
    pub fn quantile(&self, q: f64) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let mut sorted = self.recent.clone();
        sorted.sort_by(f64::total_cmp);
        let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Snapshot with derived percentiles.
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bucket_bounds: self.bucket_bounds.clone(),
            bucket_counts: self.bucket_counts.clone(),
            count: self.count,
            sum: self.sum,
            p50: self.quantile(0.50),
            p90: self.quantile(0.90),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
        }
    }
}

/// Jain's fairness index over a set of served counts.
///
/// `(Σx)² / (n·Σx²)`: 1.0 is perfectly fair, `1/n` maximally unfair.
/// Empty or all-zero inputs score 1.0.
#[must_use]
pub fn jains_index(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let sum: f64 = values.iter().sum();
    let squares: f64 = values.iter().map(|v| v * v).sum();
    if squares == 0.0 {
        return 1.0;
    }
    (sum * sum) / (values.len() as f64 * squares)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_and_percentiles() {
        let mut hist = Histogram::new(&[10.0, 50.0, 100.0]);
        for v in [5.0, 20.0, 60.0, 200.0] {
            hist.observe(v);
        }
        let snap = hist.snapshot();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.bucket_counts, vec![1, 1, 1, 1]);
        assert!(snap.p99 >= snap.p50);
    }

    #[test]
    fn jains_index_bounds() {
        assert_eq!(jains_index(&[]), 1.0);
        assert!((jains_index(&[3.0, 3.0, 3.0]) - 1.0).abs() < 1e-9);
        let skewed = jains_index(&[10.0, 0.0, 0.0]);
        assert!((skewed - 1.0 / 3.0).abs() < 1e-9);
    }
}
