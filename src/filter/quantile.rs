// src/filter/quantile.rs
//! High-percentile estimation used to derive the funnel's dynamic upper bounds.

use crate::config::{EstimatorConfig, EstimatorKind};
use crate::error::PipelineError;
use std::cmp::Ordering;

pub trait QuantileEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Approximate `q`-quantile of the finite values in `values`. `column`
    /// only names the input in errors.
    fn estimate(&self, column: &str, values: &[f64], q: f64) -> Result<f64, PipelineError>;
}

pub fn build_estimator(config: &EstimatorConfig) -> Box<dyn QuantileEstimator> {
    match config.kind {
        EstimatorKind::TDigest => Box::new(TDigestEstimator::new(config.compression)),
        EstimatorKind::Exact => Box::new(ExactEstimator),
    }
}

fn check_quantile(q: f64) -> Result<(), PipelineError> {
    if q > 0.0 && q < 1.0 {
        Ok(())
    } else {
        Err(PipelineError::InvalidQuantile(q))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Merging t-digest. Values are buffered and folded into the centroid list in
/// sorted runs, so the input itself is never sorted as a whole.
#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    buffer_cap: usize,
    total_weight: f64,
    min: f64,
    max: f64,
}

impl TDigest {
    pub fn new(compression: f64) -> Self {
        let compression = compression.max(10.0);
        let buffer_cap = (compression * 5.0) as usize;
        Self {
            compression,
            centroids: Vec::new(),
            buffer: Vec::with_capacity(buffer_cap),
            buffer_cap,
            total_weight: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    /// Non-finite values are ignored.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buffer.push(value);
        if self.buffer.len() >= self.buffer_cap {
            self.flush();
        }
    }

    pub fn count(&self) -> f64 {
        self.total_weight + self.buffer.len() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0.0
    }

    pub fn centroid_count(&self) -> usize {
        self.centroids.len()
    }

    /// Largest weight a centroid centred at quantile `q` may carry.
    fn max_weight(&self, q: f64) -> f64 {
        (4.0 * self.total_weight * q * (1.0 - q) / self.compression).max(1.0)
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.buffer.sort_by(f64::total_cmp);
        self.total_weight += self.buffer.len() as f64;

        let merged = merge_runs(&self.centroids, &self.buffer);
        self.buffer.clear();

        let mut compressed = Vec::with_capacity(merged.len());
        let mut iter = merged.into_iter();
        let Some(mut current) = iter.next() else {
            self.centroids = compressed;
            return;
        };
        let mut cumulative = 0.0;
        for c in iter {
            let proposed = current.weight + c.weight;
            let q = (cumulative + proposed / 2.0) / self.total_weight;
            if proposed <= self.max_weight(q) {
                current.mean += (c.mean - current.mean) * c.weight / proposed;
                current.weight = proposed;
            } else {
                cumulative += current.weight;
                compressed.push(current);
                current = c;
            }
        }
        compressed.push(current);
        self.centroids = compressed;
    }

    /// Estimate the `q`-quantile, or `None` when nothing has been added.
    pub fn quantile(&mut self, q: f64) -> Option<f64> {
        self.flush();
        let first = *self.centroids.first()?;
        let last = *self.centroids.last()?;
        let target = q.clamp(0.0, 1.0) * self.total_weight;

        if target <= first.weight / 2.0 {
            let span = first.weight / 2.0;
            let t = if span > 0.0 { target / span } else { 1.0 };
            return Some(self.min + (first.mean - self.min) * t);
        }
        if target >= self.total_weight - last.weight / 2.0 {
            let span = last.weight / 2.0;
            let into = target - (self.total_weight - span);
            let t = if span > 0.0 { into / span } else { 0.0 };
            return Some((last.mean + (self.max - last.mean) * t).clamp(self.min, self.max));
        }

        let mut cumulative = 0.0;
        for pair in self.centroids.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            let left_center = cumulative + left.weight / 2.0;
            let right_center = cumulative + left.weight + right.weight / 2.0;
            if target <= right_center {
                let t = (target - left_center) / (right_center - left_center);
                let v = left.mean + (right.mean - left.mean) * t;
                return Some(v.clamp(self.min, self.max));
            }
            cumulative += left.weight;
        }
        Some(last.mean.clamp(self.min, self.max))
    }
}

/// Merge two runs that are each sorted by mean.
fn merge_runs(existing: &[Centroid], incoming: &[f64]) -> Vec<Centroid> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let (mut i, mut j) = (0, 0);
    while i < existing.len() || j < incoming.len() {
        let take_existing = match (existing.get(i), incoming.get(j)) {
            (Some(c), Some(v)) => c.mean.total_cmp(v) != Ordering::Greater,
            (Some(_), None) => true,
            _ => false,
        };
        if take_existing {
            merged.push(existing[i]);
            i += 1;
        } else {
            merged.push(Centroid {
                mean: incoming[j],
                weight: 1.0,
            });
            j += 1;
        }
    }
    merged
}

/// Default estimator: one t-digest per call.
#[derive(Debug, Clone, Copy)]
pub struct TDigestEstimator {
    compression: f64,
}

impl TDigestEstimator {
    pub fn new(compression: f64) -> Self {
        Self { compression }
    }
}

impl Default for TDigestEstimator {
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl QuantileEstimator for TDigestEstimator {
    fn name(&self) -> &'static str {
        "tdigest"
    }

    fn estimate(&self, column: &str, values: &[f64], q: f64) -> Result<f64, PipelineError> {
        check_quantile(q)?;
        let mut digest = TDigest::new(self.compression);
        for &v in values {
            digest.add(v);
        }
        digest
            .quantile(q)
            .ok_or_else(|| PipelineError::ThresholdUndefined {
                column: column.to_string(),
            })
    }
}

/// Sort-based estimator with linear interpolation between closest ranks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactEstimator;

impl QuantileEstimator for ExactEstimator {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn estimate(&self, column: &str, values: &[f64], q: f64) -> Result<f64, PipelineError> {
        check_quantile(q)?;
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Err(PipelineError::ThresholdUndefined {
                column: column.to_string(),
            });
        }
        sorted.sort_by(f64::total_cmp);

        let pos = q * (sorted.len() - 1) as f64;
        let lower = pos.floor() as usize;
        let upper = (pos.ceil() as usize).min(sorted.len() - 1);
        let fraction = pos - lower as f64;
        Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tens() -> Vec<f64> {
        (1..=100).map(|i| (i * 10) as f64).collect()
    }

    #[test]
    fn high_quantile_of_small_set_sits_in_the_top_bucket() {
        for estimator in [
            Box::new(TDigestEstimator::default()) as Box<dyn QuantileEstimator>,
            Box::new(ExactEstimator),
        ] {
            let v = estimator.estimate("x", &tens(), 0.999).unwrap();
            assert!((990.0..=1000.0).contains(&v), "{}: {v}", estimator.name());
        }
    }

    #[test]
    fn tdigest_tracks_tail_of_large_uniform_input() {
        // interleave so the buffer never sees a sorted run
        let n = 100_000u32;
        let values: Vec<f64> = (0..n).map(|i| ((i * 7919) % n + 1) as f64).collect();
        let estimate = TDigestEstimator::default()
            .estimate("x", &values, 0.999)
            .unwrap();
        assert!((estimate - 99_900.0).abs() < 50.0, "{estimate}");

        let mut digest = TDigest::new(100.0);
        values.iter().for_each(|&v| digest.add(v));
        digest.quantile(0.5);
        assert!(digest.centroid_count() < 1_000);
    }

    #[test]
    fn empty_or_all_nan_input_has_no_threshold() {
        let estimator = TDigestEstimator::default();
        let err = estimator.estimate("TRIP_DISTANCE", &[], 0.999).unwrap_err();
        assert!(matches!(err, PipelineError::ThresholdUndefined { column } if column == "TRIP_DISTANCE"));
        assert!(matches!(
            ExactEstimator.estimate("x", &[f64::NAN], 0.5),
            Err(PipelineError::ThresholdUndefined { .. })
        ));
    }

    #[test]
    fn out_of_range_quantile_is_rejected() {
        for q in [0.0, 1.0, -0.5, f64::NAN] {
            assert!(matches!(
                TDigestEstimator::default().estimate("x", &[1.0], q),
                Err(PipelineError::InvalidQuantile(_))
            ));
        }
    }

    #[test]
    fn non_finite_values_are_ignored() {
        let mut values = tens();
        values.push(f64::NAN);
        values.push(f64::INFINITY);
        let v = TDigestEstimator::default().estimate("x", &values, 0.999).unwrap();
        assert!(v <= 1000.0);
        assert_eq!(ExactEstimator.estimate("x", &values, 0.5).unwrap(), 505.0);
    }

    #[test]
    fn estimates_are_deterministic_and_bounded() {
        let values: Vec<f64> = (0..10_000).map(|i| ((i * 31) % 977) as f64 * 0.5).collect();
        let a = TDigestEstimator::default().estimate("x", &values, 0.999).unwrap();
        let b = TDigestEstimator::default().estimate("x", &values, 0.999).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
        assert!(a <= 488.0);
        assert_eq!(TDigestEstimator::default().estimate("x", &[7.0], 0.9).unwrap(), 7.0);
    }
}
