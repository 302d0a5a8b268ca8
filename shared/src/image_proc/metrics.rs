//! Per-plane image quality metrics
//!
//! Every function here reduces each plane of an [`ImageStack`] to a single
//! number (or a position), so the output of a sweep lines up index for index
//! with the control values that produced it.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, Axis};
use sheet_math::stats::{percentile, StatsError};
use std::f64::consts::PI;

use super::ImageStack;

/// Default PSF support diameter in pixels used to bound the DCT band
pub const DCTS_DEFAULT_PSF_SUPPORT: f64 = 3.0;

/// Orthonormal DCT-II basis, rows are frequencies
fn dct_basis(n: usize) -> Array2<f64> {
    let n_f = n as f64;
    Array2::from_shape_fn((n, n), |(k, i)| {
        let scale = if k == 0 {
            (1.0 / n_f).sqrt()
        } else {
            (2.0 / n_f).sqrt()
        };
        scale * (PI / n_f * (i as f64 + 0.5) * k as f64).cos()
    })
}

fn dcts_with_basis(
    plane: ArrayView2<u16>,
    basis_rows: &Array2<f64>,
    basis_cols: &Array2<f64>,
    psf_support: f64,
) -> f64 {
    let data = plane.mapv(f64::from);
    let coefficients = basis_rows.dot(&data).dot(&basis_cols.t());

    let norm = coefficients.iter().map(|c| c * c).sum::<f64>().sqrt();
    if norm <= 0.0 {
        return 0.0;
    }

    let (h, w) = plane.dim();
    let support = (h.min(w) as f64 / psf_support).max(1.0);

    let mut entropy = 0.0;
    for ((ky, kx), &c) in coefficients.indexed_iter() {
        if (kx + ky) as f64 >= support {
            continue;
        }
        let p = c.abs() / norm;
        if p > 0.0 {
            entropy -= p * p.log2();
        }
    }

    2.0 * entropy / (support * support)
}

/// Normalized DCT Shannon entropy of one plane
///
/// Larger values mean more energy spread across spatial frequencies inside
/// the optical band, i.e. a sharper image. Frequencies with `kx + ky`
/// beyond `min(h, w) / psf_support` are ignored as noise.
pub fn dcts_2d(plane: ArrayView2<u16>, psf_support: f64) -> f64 {
    let (h, w) = plane.dim();
    if h == 0 || w == 0 {
        return 0.0;
    }
    dcts_with_basis(plane, &dct_basis(h), &dct_basis(w), psf_support)
}

/// DCTS for every plane, computed in parallel
pub fn dcts_per_plane(stack: &ImageStack, psf_support: f64) -> Vec<f64> {
    if stack.is_empty() {
        return Vec::new();
    }
    let (h, w) = stack.plane_shape();
    let basis_rows = dct_basis(h);
    let basis_cols = dct_basis(w);

    stack
        .data()
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|plane| dcts_with_basis(plane, &basis_rows, &basis_cols, psf_support))
        .collect()
}

/// Robust per-plane intensity: the `p`-th percentile of each plane
pub fn percentile_intensity_per_plane(stack: &ImageStack, p: f64) -> Result<Vec<f64>, StatsError> {
    stack
        .data()
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|plane| {
            let values: Vec<f64> = plane.iter().map(|&v| f64::from(v)).collect();
            percentile(&values, p)
        })
        .collect()
}

/// Plane as `f64` with its minimum subtracted
pub fn clean_with_min(plane: ArrayView2<u16>) -> Array2<f64> {
    let min = plane.iter().copied().min().unwrap_or(0);
    plane.mapv(|v| f64::from(v - min))
}

/// Intensity-weighted centre of the brightest region, in pixels `(x, y)`
///
/// After background removal, only pixels at or above `fraction` of the
/// maximum contribute. Returns `None` for a featureless plane.
pub fn brightest_points_centroid(plane: ArrayView2<u16>, fraction: f64) -> Option<(f64, f64)> {
    let cleaned = clean_with_min(plane);
    let max = cleaned.iter().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return None;
    }
    let threshold = fraction * max;

    let mut sum = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    for ((row, col), &value) in cleaned.indexed_iter() {
        if value >= threshold {
            sum += value;
            sum_x += value * col as f64;
            sum_y += value * row as f64;
        }
    }

    Some((sum_x / sum, sum_y / sum))
}

/// Brightest-region centroid mapped to image-relative `[-1, 1]` coordinates
///
/// A pixel position `p` on an axis of length `n` maps to `2 (p - n/2) / n`.
pub fn normalized_centroid(plane: ArrayView2<u16>, fraction: f64) -> Option<(f64, f64)> {
    let (h, w) = plane.dim();
    let (x, y) = brightest_points_centroid(plane, fraction)?;
    let half_w = w as f64 / 2.0;
    let half_h = h as f64 / 2.0;
    Some(((x - half_w) / half_w, (y - half_h) / half_h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn box_blur(plane: &Array2<u16>, radius: usize) -> Array2<u16> {
        let (h, w) = plane.dim();
        Array2::from_shape_fn((h, w), |(r, c)| {
            let mut sum = 0u32;
            let mut n = 0u32;
            for rr in r.saturating_sub(radius)..(r + radius + 1).min(h) {
                for cc in c.saturating_sub(radius)..(c + radius + 1).min(w) {
                    sum += u32::from(plane[[rr, cc]]);
                    n += 1;
                }
            }
            (sum / n) as u16
        })
    }

    #[test]
    fn test_dcts_prefers_sharp_plane() {
        let mut rng = StdRng::seed_from_u64(7);
        let sharp = Array2::from_shape_fn((32, 32), |_| rng.gen_range(100..1100u16));
        let blurred = box_blur(&sharp, 3);

        assert!(dcts_2d(sharp.view(), 3.0) > dcts_2d(blurred.view(), 3.0));
    }

    #[test]
    fn test_dcts_of_blank_plane_is_zero() {
        let blank = Array2::<u16>::zeros((8, 8));
        assert_eq!(dcts_2d(blank.view(), 3.0), 0.0);
    }

    #[test]
    fn test_dcts_per_plane_keeps_plane_order() {
        let mut rng = StdRng::seed_from_u64(11);
        let sharp = Array2::from_shape_fn((16, 16), |_| rng.gen_range(0..1000u16));
        let blurred = box_blur(&sharp, 2);
        let stack = ImageStack::from_planes(&[blurred.clone(), sharp.clone(), blurred]).unwrap();

        let values = dcts_per_plane(&stack, 3.0);

        assert_eq!(values.len(), 3);
        assert_relative_eq!(values[1], dcts_2d(sharp.view(), 3.0), epsilon = 1e-12);
        assert!(values[1] > values[0]);
        assert_relative_eq!(values[0], values[2], epsilon = 1e-12);
    }

    #[test]
    fn test_percentile_intensity_per_plane() {
        let data = Array3::from_shape_fn((2, 10, 10), |(p, r, c)| ((r * 10 + c) * (p + 1)) as u16);
        let stack = ImageStack::new(data);

        let values = percentile_intensity_per_plane(&stack, 50.0).unwrap();

        assert_relative_eq!(values[0], 49.5, epsilon = 1e-12);
        assert_relative_eq!(values[1], 99.0, epsilon = 1e-12);
    }

    #[test]
    fn test_brightest_points_centroid_finds_spot() {
        let mut plane = Array2::<u16>::from_elem((20, 30), 50);
        plane[[5, 20]] = 1000;
        plane[[5, 21]] = 1000;

        let (x, y) = brightest_points_centroid(plane.view(), 0.5).unwrap();

        assert_relative_eq!(x, 20.5, epsilon = 1e-12);
        assert_relative_eq!(y, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_normalized_centroid_range() {
        let mut plane = Array2::<u16>::zeros((10, 10));
        plane[[5, 5]] = 10;
        let (x, y) = normalized_centroid(plane.view(), 0.5).unwrap();
        assert_relative_eq!(x, 0.0);
        assert_relative_eq!(y, 0.0);

        plane[[5, 5]] = 0;
        plane[[0, 0]] = 10;
        let (x, y) = normalized_centroid(plane.view(), 0.5).unwrap();
        assert_relative_eq!(x, -1.0);
        assert_relative_eq!(y, -1.0);
    }

    #[test]
    fn test_featureless_plane_has_no_centroid() {
        let plane = Array2::<u16>::from_elem((4, 4), 7);
        assert!(brightest_points_centroid(plane.view(), 0.5).is_none());
    }
}
