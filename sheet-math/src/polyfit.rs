//! Least-squares polynomial fitting
//!
//! Power compensation curves are stored as low-degree polynomials of the
//! sheet dimension (height or width). Coefficients are kept in ascending
//! order, `c[0] + c[1]·x + c[2]·x²`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from curve fitting
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("insufficient samples: got {got}, need at least {need}")]
    InsufficientSamples { got: usize, need: usize },

    #[error("sample length mismatch: {x} x-values, {y} y-values")]
    LengthMismatch { x: usize, y: usize },

    #[error("least-squares solve failed: {0}")]
    Solve(String),
}

/// Polynomial with coefficients in ascending power order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    coefficients: Vec<f64>,
}

impl Polynomial {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    /// Constant polynomial `p(x) = value`
    pub fn constant(value: f64) -> Self {
        Self::new(vec![value])
    }

    /// Fit a polynomial of the given degree to `(x, y)` samples
    ///
    /// Needs at least `degree + 1` samples. The Vandermonde system is solved
    /// with an SVD so nearly-collinear abscissas degrade gracefully.
    pub fn fit(x: &[f64], y: &[f64], degree: usize) -> Result<Self, FitError> {
        if x.len() != y.len() {
            return Err(FitError::LengthMismatch {
                x: x.len(),
                y: y.len(),
            });
        }
        let need = degree + 1;
        if x.len() < need {
            return Err(FitError::InsufficientSamples { got: x.len(), need });
        }

        let vandermonde = DMatrix::from_fn(x.len(), need, |r, c| x[r].powi(c as i32));
        let rhs = DVector::from_column_slice(y);

        let solution = vandermonde
            .svd(true, true)
            .solve(&rhs, 1e-14)
            .map_err(|e| FitError::Solve(e.to_string()))?;

        Ok(Self::new(solution.iter().copied().collect()))
    }

    /// Evaluate with Horner's scheme
    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * x + c)
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Coefficient of determination of this polynomial against samples
    pub fn r_squared(&self, x: &[f64], y: &[f64]) -> f64 {
        let n = y.len().min(x.len());
        if n == 0 {
            return 0.0;
        }
        let y_mean = y[..n].iter().sum::<f64>() / n as f64;
        let ss_tot: f64 = y[..n].iter().map(|v| (v - y_mean).powi(2)).sum();
        let ss_res: f64 = x[..n]
            .iter()
            .zip(&y[..n])
            .map(|(&xi, &yi)| (yi - self.eval(xi)).powi(2))
            .sum();

        if ss_tot <= f64::EPSILON {
            return if ss_res <= f64::EPSILON { 1.0 } else { 0.0 };
        }
        1.0 - ss_res / ss_tot
    }
}

impl Default for Polynomial {
    /// Unit gain: no compensation applied
    fn default() -> Self {
        Self::constant(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_exact_quadratic() {
        let x: Vec<f64> = (0..8).map(|i| i as f64 * 0.25).collect();
        let y: Vec<f64> = x.iter().map(|x| 1.5 - 0.5 * x + 2.0 * x * x).collect();

        let poly = Polynomial::fit(&x, &y, 2).unwrap();

        assert_eq!(poly.degree(), 2);
        assert_relative_eq!(poly.coefficients()[0], 1.5, epsilon = 1e-9);
        assert_relative_eq!(poly.coefficients()[1], -0.5, epsilon = 1e-9);
        assert_relative_eq!(poly.coefficients()[2], 2.0, epsilon = 1e-9);
        assert_relative_eq!(poly.r_squared(&x, &y), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fit_needs_enough_samples() {
        let err = Polynomial::fit(&[0.0, 1.0], &[1.0, 2.0], 2).unwrap_err();
        assert_eq!(err, FitError::InsufficientSamples { got: 2, need: 3 });
    }

    #[test]
    fn test_fit_rejects_mismatched_lengths() {
        let err = Polynomial::fit(&[0.0, 1.0, 2.0], &[1.0, 2.0], 1).unwrap_err();
        assert_eq!(err, FitError::LengthMismatch { x: 3, y: 2 });
    }

    #[test]
    fn test_eval_horner() {
        let poly = Polynomial::new(vec![1.0, 2.0, 3.0]);
        assert_relative_eq!(poly.eval(2.0), 1.0 + 4.0 + 12.0);
        assert_relative_eq!(Polynomial::default().eval(123.0), 1.0);
    }
}
