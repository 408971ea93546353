// ========================================================================================
//
//                 The threshold optimizer: iterative intermeans refinement
//
// ========================================================================================
//
// Given one channel's intensities for one sample and a seed label per cell, this module
// finds a locally optimal positive/negative boundary. The seed fixes the starting point
// (the midpoint of the seed-positive and seed-negative means). Each step then reassigns
// every cell against the current boundary (inclusive, `x >= t` is positive) and moves
// the boundary to the midpoint of the two new class means. The fixed point of this
// update is a local minimum of the within-class squared error.
//
// Determinism: class sums are accumulated per fixed-size chunk and the chunk partials
// are folded in chunk order, so the floating-point summation order never depends on
// how the thread pool happened to schedule the work.

use crate::config::OptimizerConfig;
use rayon::prelude::*;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum DegenerateReason {
    #[error("the intensity vector is empty")]
    Empty,
    #[error("all intensities equal {0}")]
    Constant(f64),
    #[error("intensity at cell {0} is not finite")]
    NonFinite(usize),
    /// The seed put every cell in one class; the flag tells which one.
    #[error("the seed assigns every cell to the same class")]
    SingleSeedClass(bool),
    #[error("one class became empty at boundary {0}")]
    Collapsed(f64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("cannot separate the intensity distribution: {0}")]
    DegenerateInput(DegenerateReason),
    #[error("{cells} intensities were given with {seeds} seed labels")]
    SeedLengthMismatch { cells: usize, seeds: usize },
    #[error("seed fraction {0} must lie strictly between 0 and 1")]
    InvalidSeedFraction(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizedThreshold {
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Cells at or above `value`.
    pub positive_cells: usize,
}

/// Sums for the two classes of one split.
#[derive(Debug, Clone, Copy, Default)]
struct SplitSums {
    positive_sum: f64,
    positive_n: usize,
    negative_sum: f64,
    negative_n: usize,
}

impl SplitSums {
    #[inline(always)]
    fn add(&mut self, value: f64, positive: bool) {
        if positive {
            self.positive_sum += value;
            self.positive_n += 1;
        } else {
            self.negative_sum += value;
            self.negative_n += 1;
        }
    }

    fn merge(mut self, other: SplitSums) -> SplitSums {
        self.positive_sum += other.positive_sum;
        self.positive_n += other.positive_n;
        self.negative_sum += other.negative_sum;
        self.negative_n += other.negative_n;
        self
    }

    /// Midpoint of the two class means, or `None` when a class is empty.
    fn intermean(&self) -> Option<f64> {
        if self.positive_n == 0 || self.negative_n == 0 {
            return None;
        }
        let positive_mean = self.positive_sum / self.positive_n as f64;
        let negative_mean = self.negative_sum / self.negative_n as f64;
        Some(0.5 * (positive_mean + negative_mean))
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdOptimizer {
    config: OptimizerConfig,
    chunk_size: usize,
}

impl ThresholdOptimizer {
    pub fn new(config: OptimizerConfig, chunk_size: usize) -> Self {
        Self {
            config,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn optimize(
        &self,
        values: &[f64],
        seeds: &[bool],
    ) -> Result<OptimizedThreshold, OptimizeError> {
        if values.len() != seeds.len() {
            return Err(OptimizeError::SeedLengthMismatch {
                cells: values.len(),
                seeds: seeds.len(),
            });
        }
        let (min, max) = validated_range(values)?;

        let seed_sums = self.sums_by_seed(values, seeds);
        let mut boundary = match seed_sums.intermean() {
            Some(t) => t,
            None => {
                return Err(OptimizeError::DegenerateInput(
                    DegenerateReason::SingleSeedClass(seed_sums.positive_n > 0),
                ));
            }
        };

        let step_limit = self.config.tolerance * (max - min);
        let mut iterations = 0;
        let mut converged = false;
        while iterations < self.config.max_iterations {
            iterations += 1;
            let next = self
                .sums_at(values, boundary)
                .intermean()
                .ok_or(OptimizeError::DegenerateInput(DegenerateReason::Collapsed(
                    boundary,
                )))?;
            let moved = (next - boundary).abs();
            boundary = next;
            if moved <= step_limit {
                converged = true;
                break;
            }
        }

        if !converged {
            log::warn!(
                "Threshold refinement stopped at {boundary} after {iterations} iterations without converging"
            );
        }

        let positive_cells = self.sums_at(values, boundary).positive_n;
        log::debug!(
            "Optimized threshold {boundary} in {iterations} iterations ({positive_cells}/{} cells positive)",
            values.len()
        );
        Ok(OptimizedThreshold {
            value: boundary,
            iterations,
            converged,
            positive_cells,
        })
    }

    fn sums_by_seed(&self, values: &[f64], seeds: &[bool]) -> SplitSums {
        let partials: Vec<SplitSums> = values
            .par_chunks(self.chunk_size)
            .zip(seeds.par_chunks(self.chunk_size))
            .map(|(chunk, labels)| {
                let mut sums = SplitSums::default();
                for (&value, &positive) in chunk.iter().zip(labels) {
                    sums.add(value, positive);
                }
                sums
            })
            .collect();
        partials.into_iter().fold(SplitSums::default(), SplitSums::merge)
    }

    fn sums_at(&self, values: &[f64], boundary: f64) -> SplitSums {
        let partials: Vec<SplitSums> = values
            .par_chunks(self.chunk_size)
            .map(|chunk| {
                let mut sums = SplitSums::default();
                for &value in chunk {
                    sums.add(value, value >= boundary);
                }
                sums
            })
            .collect();
        partials.into_iter().fold(SplitSums::default(), SplitSums::merge)
    }
}

fn validated_range(values: &[f64]) -> Result<(f64, f64), OptimizeError> {
    if values.is_empty() {
        return Err(OptimizeError::DegenerateInput(DegenerateReason::Empty));
    }
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for (idx, &value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(OptimizeError::DegenerateInput(DegenerateReason::NonFinite(
                idx,
            )));
        }
        min = min.min(value);
        max = max.max(value);
    }
    if min == max {
        return Err(OptimizeError::DegenerateInput(DegenerateReason::Constant(
            min,
        )));
    }
    Ok((min, max))
}

/// Labels the brightest `fraction` of cells positive. Ties in intensity are broken by
/// cell index so the labelling is reproducible.
pub fn seed_from_fraction(values: &[f64], fraction: f64) -> Result<Vec<bool>, OptimizeError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(OptimizeError::InvalidSeedFraction(fraction));
    }
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| match values[b].total_cmp(&values[a]) {
        Ordering::Equal => a.cmp(&b),
        other => other,
    });

    let positives = (fraction * values.len() as f64).round() as usize;
    let mut seeds = vec![false; values.len()];
    for &idx in order.iter().take(positives) {
        seeds[idx] = true;
    }
    Ok(seeds)
}
