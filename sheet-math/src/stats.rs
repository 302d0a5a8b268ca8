//! Robust statistics over sampled metric curves

use thiserror::Error;

/// Errors from statistical reductions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("no finite values to reduce")]
    Empty,

    #[error("percentile {0} outside [0, 100]")]
    InvalidPercentile(f64),
}

fn finite_sorted(values: &[f64]) -> Result<Vec<f64>, StatsError> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return Err(StatsError::Empty);
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    Ok(finite)
}

/// Calculate median of a slice of f64 values
///
/// NaN values are filtered out; infinities are kept and sort to the ends.
/// Even-length inputs return the mean of the two central values.
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let sorted = finite_sorted(values)?;
    let n = sorted.len();

    if n % 2 == 0 {
        Ok((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0)
    } else {
        Ok(sorted[n / 2])
    }
}

/// Percentile with linear interpolation between closest ranks
///
/// `p` is given in percent, `percentile(v, 50.0)` equals `median(v)`.
pub fn percentile(values: &[f64], p: f64) -> Result<f64, StatsError> {
    if !(0.0..=100.0).contains(&p) {
        return Err(StatsError::InvalidPercentile(p));
    }
    let sorted = finite_sorted(values)?;

    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;

    Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Three-point box smoothing, one forward then one backward pass per iteration
///
/// Endpoints are left untouched. The passes work in place, so each update
/// already sees its smoothed predecessor.
pub fn smooth_in_place(values: &mut [f64], iterations: usize) {
    let n = values.len();
    if n < 3 {
        return;
    }

    for _ in 0..iterations {
        for i in 1..n - 1 {
            values[i] = (values[i - 1] + values[i] + values[i + 1]) / 3.0;
        }
        for i in (1..n - 1).rev() {
            values[i] = (values[i - 1] + values[i] + values[i + 1]) / 3.0;
        }
    }
}

/// Index of the value closest to `target`, first index on ties
pub fn nearest_index(values: &[f64], target: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        let distance = (v - target).abs();
        if distance.is_nan() {
            continue;
        }
        match best {
            Some((_, d)) if d <= distance => {}
            _ => best = Some((i, distance)),
        }
    }
    best.map(|(i, _)| i)
}
