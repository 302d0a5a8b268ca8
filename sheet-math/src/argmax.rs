//! Peak location on sampled metric curves
//!
//! A finder receives paired `(control value, metric)` samples and estimates
//! where the metric peaks together with a confidence in `[0, 1]`. A finder
//! returns `None` when the curve has no usable peak (flat, convex, or the
//! vertex falls outside the sampled range); callers substitute
//! [`ArgMaxFit::FALLBACK`] for that case.

use crate::polyfit::Polynomial;

/// Estimated peak location and confidence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgMaxFit {
    pub argmax: f64,
    /// Confidence in `[0, 1]`
    pub probability: f64,
}

impl ArgMaxFit {
    /// Result used when no peak can be found: zero location, zero confidence
    pub const FALLBACK: ArgMaxFit = ArgMaxFit {
        argmax: 0.0,
        probability: 0.0,
    };

    fn new(argmax: f64, probability: f64) -> Self {
        Self {
            argmax,
            probability: if probability.is_nan() {
                0.0
            } else {
                probability.clamp(0.0, 1.0)
            },
        }
    }
}

/// Strategy for locating the peak of a sampled curve
pub trait ArgMaxFinder: Send + Sync {
    fn argmax(&self, x: &[f64], y: &[f64]) -> Option<ArgMaxFit>;

    /// Peak estimate, or [`ArgMaxFit::FALLBACK`] when none is found
    fn argmax_or_fallback(&self, x: &[f64], y: &[f64]) -> ArgMaxFit {
        self.argmax(x, y).unwrap_or(ArgMaxFit::FALLBACK)
    }
}

const FLAT_CURVE_EPSILON: f64 = 1e-12;

fn discrete_peak(y: &[f64]) -> Option<(usize, f64, f64)> {
    let mut best: Option<(usize, f64)> = None;
    let mut min = f64::INFINITY;
    for (i, &v) in y.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        min = min.min(v);
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, max)| (i, max, min))
}

/// Parabola fitted over a window centred on the discrete maximum
///
/// The confidence is the R² of the local fit, so a clean unimodal peak
/// scores near 1 and a noisy or lopsided curve scores low.
#[derive(Debug, Clone)]
pub struct ParabolaArgMaxFinder {
    /// Samples taken on each side of the discrete maximum
    pub half_window: usize,
}

impl Default for ParabolaArgMaxFinder {
    fn default() -> Self {
        Self { half_window: 3 }
    }
}

impl ArgMaxFinder for ParabolaArgMaxFinder {
    fn argmax(&self, x: &[f64], y: &[f64]) -> Option<ArgMaxFit> {
        if x.len() != y.len() || x.len() < 3 {
            return None;
        }
        let (peak, max, min) = discrete_peak(y)?;
        if max - min < FLAT_CURVE_EPSILON {
            return None;
        }

        let half = self.half_window.max(1);
        let mut lo = peak.saturating_sub(half);
        let mut hi = (peak + half).min(x.len() - 1);
        // keep at least three points when the peak sits on an edge
        while hi - lo < 2 {
            if lo > 0 {
                lo -= 1;
            } else if hi < x.len() - 1 {
                hi += 1;
            } else {
                return None;
            }
        }

        let xs = &x[lo..=hi];
        let ys = &y[lo..=hi];
        let poly = Polynomial::fit(xs, ys, 2).ok()?;
        let c = poly.coefficients();
        let (b, a) = (c[1], c[2]);
        if a >= 0.0 {
            return None;
        }

        let vertex = -b / (2.0 * a);
        let (x_min, x_max) = xs
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if !(x_min..=x_max).contains(&vertex) {
            return None;
        }

        Some(ArgMaxFit::new(vertex, poly.r_squared(xs, ys)))
    }
}

/// Centre of mass of the curve above its minimum
///
/// Robust on broad or plateau-shaped peaks where a parabola fits poorly.
/// The confidence measures how concentrated the mass is: a single spike
/// scores near 1, a flat curve scores 0.
#[derive(Debug, Clone, Default)]
pub struct CentroidArgMaxFinder;

impl ArgMaxFinder for CentroidArgMaxFinder {
    fn argmax(&self, x: &[f64], y: &[f64]) -> Option<ArgMaxFit> {
        if x.len() != y.len() || x.is_empty() {
            return None;
        }
        let (_, max, min) = discrete_peak(y)?;
        let range = max - min;
        if range < FLAT_CURVE_EPSILON {
            return None;
        }

        let mut mass = 0.0;
        let mut moment = 0.0;
        for (&xi, &yi) in x.iter().zip(y) {
            if !yi.is_finite() {
                continue;
            }
            let w = yi - min;
            mass += w;
            moment += w * xi;
        }
        if mass <= 0.0 {
            return None;
        }

        let mean_weight = mass / (range * x.len() as f64);
        Some(ArgMaxFit::new(moment / mass, 1.0 - mean_weight))
    }
}

/// Runs the parabola and centroid finders and keeps the more confident one
#[derive(Debug, Clone, Default)]
pub struct SmartArgMaxFinder {
    parabola: ParabolaArgMaxFinder,
    centroid: CentroidArgMaxFinder,
}

impl ArgMaxFinder for SmartArgMaxFinder {
    fn argmax(&self, x: &[f64], y: &[f64]) -> Option<ArgMaxFit> {
        match (self.parabola.argmax(x, y), self.centroid.argmax(x, y)) {
            (Some(p), Some(c)) => Some(if c.probability > p.probability { c } else { p }),
            (p, c) => p.or(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn gaussian_curve(center: f64) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..17).map(|i| -1.0 + i as f64 * 0.125).collect();
        let y = x
            .iter()
            .map(|x| (-(x - center).powi(2) / (2.0 * 0.3f64.powi(2))).exp())
            .collect();
        (x, y)
    }

    #[test]
    fn test_parabola_finds_offset_peak() {
        let (x, y) = gaussian_curve(0.25);
        let fit = ParabolaArgMaxFinder::default().argmax(&x, &y).unwrap();

        assert_relative_eq!(fit.argmax, 0.25, epsilon = 1e-6);
        assert!(fit.probability > 0.9);
    }

    #[test]
    fn test_parabola_rejects_flat_and_monotonic() {
        let x = [0.0, 1.0, 2.0, 3.0];
        assert!(ParabolaArgMaxFinder::default()
            .argmax(&x, &[1.0; 4])
            .is_none());
        // convex curve has no maximum
        assert!(ParabolaArgMaxFinder::default()
            .argmax(&x, &[4.0, 1.0, 1.0, 4.0])
            .is_none());
    }

    #[test]
    fn test_centroid_symmetric_peak() {
        let (x, y) = gaussian_curve(0.0);
        let fit = CentroidArgMaxFinder.argmax(&x, &y).unwrap();

        assert_relative_eq!(fit.argmax, 0.0, epsilon = 1e-9);
        assert!(fit.probability > 0.5 && fit.probability <= 1.0);
    }

    #[test]
    fn test_fallback_is_zero_zero() {
        let fit = SmartArgMaxFinder::default().argmax_or_fallback(&[0.0, 1.0], &[2.0, 2.0]);
        assert_eq!(fit, ArgMaxFit::FALLBACK);
    }

    #[test]
    fn test_smart_prefers_confident_estimate() {
        let (x, y) = gaussian_curve(-0.3);
        let smart = SmartArgMaxFinder::default().argmax(&x, &y).unwrap();
        let parabola = ParabolaArgMaxFinder::default().argmax(&x, &y).unwrap();
        let centroid = CentroidArgMaxFinder.argmax(&x, &y).unwrap();

        assert_eq!(
            smart.probability,
            parabola.probability.max(centroid.probability)
        );
    }
}
