//! Per-detector fit results of an adaptation sweep

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use sheet_math::{ArgMaxFinder, ArgMaxFit};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Peak of one metric curve together with the evidence behind it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub argmax: f64,
    /// Largest metric value on the curve
    pub metric_max: f64,
    /// Fit confidence in `[0, 1]`
    pub probability: f64,
}

impl FitResult {
    pub fn new(fit: ArgMaxFit, metric_max: f64) -> Self {
        Self {
            argmax: fit.argmax,
            metric_max,
            probability: fit.probability,
        }
    }

    /// Fit a sampled curve; a curve without a peak gives zero confidence
    pub fn evaluate(finder: &dyn ArgMaxFinder, x: &[f64], metric: &[f64]) -> Self {
        let metric_max = metric
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        let metric_max = if metric_max.is_finite() { metric_max } else { 0.0 };
        Self::new(finder.argmax_or_fallback(x, metric), metric_max)
    }

    /// Fit found no peak; the argmax carries no information
    pub fn is_fallback(&self) -> bool {
        self.probability <= 0.0
    }

    /// Weight used to arbitrate between detection arms
    pub fn evidence(&self) -> f64 {
        self.metric_max * self.probability
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("result index ({control_plane}, {light_sheet}, {detection_arm}) outside grid {shape:?}")]
pub struct ResultIndexError {
    pub control_plane: usize,
    pub light_sheet: usize,
    pub detection_arm: usize,
    pub shape: (usize, usize, usize),
}

/// Dense `(control plane, light sheet, detection arm)` result store
///
/// Clones share the same storage, so metric tasks running on the worker
/// pool write straight into the module's table. Each task writes distinct
/// keys.
#[derive(Debug, Clone)]
pub struct ResultTable {
    results: Arc<Mutex<Array3<Option<FitResult>>>>,
}

impl ResultTable {
    pub fn new(num_control_planes: usize, num_light_sheets: usize, num_detection_arms: usize) -> Self {
        Self {
            results: Arc::new(Mutex::new(Array3::from_elem(
                (num_control_planes, num_light_sheets, num_detection_arms),
                None,
            ))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Array3<Option<FitResult>>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.lock().dim()
    }

    fn check(
        shape: (usize, usize, usize),
        control_plane: usize,
        light_sheet: usize,
        detection_arm: usize,
    ) -> Result<(), ResultIndexError> {
        if control_plane < shape.0 && light_sheet < shape.1 && detection_arm < shape.2 {
            Ok(())
        } else {
            Err(ResultIndexError {
                control_plane,
                light_sheet,
                detection_arm,
                shape,
            })
        }
    }

    pub fn set(
        &self,
        control_plane: usize,
        light_sheet: usize,
        detection_arm: usize,
        result: FitResult,
    ) -> Result<(), ResultIndexError> {
        let mut results = self.lock();
        Self::check(results.dim(), control_plane, light_sheet, detection_arm)?;
        results[[control_plane, light_sheet, detection_arm]] = Some(result);
        Ok(())
    }

    pub fn get(
        &self,
        control_plane: usize,
        light_sheet: usize,
        detection_arm: usize,
    ) -> Result<Option<FitResult>, ResultIndexError> {
        let results = self.lock();
        Self::check(results.dim(), control_plane, light_sheet, detection_arm)?;
        Ok(results[[control_plane, light_sheet, detection_arm]])
    }

    /// Results of every detection arm for one grid point
    pub fn arms(
        &self,
        control_plane: usize,
        light_sheet: usize,
    ) -> Result<Vec<Option<FitResult>>, ResultIndexError> {
        let results = self.lock();
        Self::check(results.dim(), control_plane, light_sheet, 0)?;
        Ok(results
            .slice(ndarray::s![control_plane, light_sheet, ..])
            .to_vec())
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.lock().iter().filter(|r| r.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheet_math::SmartArgMaxFinder;

    #[test]
    fn test_flat_curve_has_no_confidence() {
        let x = [-1.0, 0.0, 1.0, 2.0];
        let result = FitResult::evaluate(&SmartArgMaxFinder::default(), &x, &[3.0; 4]);

        assert_eq!(result.argmax, 0.0);
        assert_eq!(result.probability, 0.0);
        assert_eq!(result.metric_max, 3.0);
        assert_eq!(result.evidence(), 0.0);
    }

    #[test]
    fn test_table_is_shared_and_bounds_checked() {
        let table = ResultTable::new(3, 2, 2);
        let writer = table.clone();
        let result = FitResult {
            argmax: 0.5,
            metric_max: 2.0,
            probability: 0.8,
        };

        writer.set(2, 1, 1, result).unwrap();

        assert_eq!(table.get(2, 1, 1).unwrap(), Some(result));
        assert_eq!(table.arms(2, 1).unwrap(), vec![None, Some(result)]);
        assert_eq!(table.len(), 1);
        assert!(table.set(3, 0, 0, result).is_err());
        assert!(table.get(0, 2, 0).is_err());
        assert!(table.arms(0, 5).is_err());

        table.clear();
        assert!(writer.is_empty());
    }
}
