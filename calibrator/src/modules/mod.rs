//! Per-axis calibration modules
//!
//! Every module samples one physical degree of freedom through acquisition
//! queues, fits a model to the sampled metric, and applies the resulting
//! correction to the device control model. The set of axes is closed:
//! [`Axis`] names each one and the engine dispatches on it.
//!
//! # Modules
//!
//! - [`z`] - light-sheet Z against the detection focal plane
//! - [`angle`] - light-sheet angle
//! - [`xy`] - light-sheet X/Y position transform
//! - [`power`] - power balance between light sheets
//! - [`power_dimension`] - power compensation against sheet height or width
//! - [`width`] - width alignment between light sheets

pub mod angle;
pub mod power;
pub mod power_dimension;
pub mod width;
pub mod xy;
pub mod z;

pub use angle::AngleCalibration;
pub use power::PowerCalibration;
pub use power_dimension::{PowerCompensation, SheetDimension};
pub use width::WidthCalibration;
pub use xy::{AxisProbe, XyCalibration};
pub use z::ZCalibration;

use serde::{Deserialize, Serialize};
use shared::image_proc::ImageStack;
use shared::microscope::{AcquisitionError, AcquisitionQueue, DeviceError, Microscope};
use sheet_math::{
    ArgMaxFinder, ArgMaxFit, DegenerateVectorsError, FitError, SingularMatrixError, StatsError,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::progress::ProgressSink;

/// Calibration axis selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Z,
    Angle,
    XY,
    Power,
    Width,
    HeightPower,
    WidthPower,
}

impl Axis {
    /// Short name used in logs and chart titles
    pub fn name(self) -> &'static str {
        match self {
            Axis::Z => "Z",
            Axis::Angle => "A",
            Axis::XY => "XY",
            Axis::Power => "P",
            Axis::Width => "W",
            Axis::HeightPower => "HP",
            Axis::WidthPower => "WP",
        }
    }

    /// Whether the axis is calibrated one light sheet at a time
    pub fn is_per_light_sheet(self) -> bool {
        !matches!(self, Axis::Power | Axis::Width)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error from one calibrate or apply step
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("fit failed: {0}")]
    Fit(#[from] FitError),

    #[error("statistics failed: {0}")]
    Stats(#[from] StatsError),

    #[error("transform is singular: {0}")]
    Singular(#[from] SingularMatrixError),

    #[error("probe axes are degenerate: {0}")]
    Degenerate(#[from] DegenerateVectorsError),

    #[error("acquisition returned {got} images, expected {expected}")]
    FrameCount { got: usize, expected: usize },

    #[error("detection arm {0} returned no stack")]
    MissingStack(usize),
}

impl CalibrationError {
    pub fn is_acquisition(&self) -> bool {
        matches!(self, CalibrationError::Acquisition(_))
    }
}

/// What a calibrate step needs from its surroundings
pub struct CalibrationContext<'a> {
    pub microscope: &'a mut dyn Microscope,
    pub sink: Arc<dyn ProgressSink>,
    pub finder: Arc<dyn ArgMaxFinder>,
    pub timeout_base: Duration,
    pub timeout_per_frame: Duration,
}

impl<'a> CalibrationContext<'a> {
    /// Play `queue` with a timeout proportional to its length
    pub fn play(&mut self, queue: &AcquisitionQueue) -> Result<Vec<ImageStack>, CalibrationError> {
        let timeout = queue.timeout(self.timeout_base, self.timeout_per_frame);
        self.microscope.play_queue(queue, timeout).map_err(|e| {
            warn!("Acquisition of {} frames failed: {}", queue.len(), e);
            CalibrationError::Acquisition(e)
        })
    }

    /// Stack of `arm`, checked to hold `expected` planes
    pub fn arm_stack<'s>(
        stacks: &'s [ImageStack],
        arm: usize,
        expected: usize,
    ) -> Result<&'s ImageStack, CalibrationError> {
        let stack = stacks.get(arm).ok_or(CalibrationError::MissingStack(arm))?;
        if stack.num_planes() != expected {
            return Err(CalibrationError::FrameCount {
                got: stack.num_planes(),
                expected,
            });
        }
        Ok(stack)
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![0.5 * (start + end)],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Probability-weighted mean of the per-arm peaks
///
/// Returns `None` when no arm produced a usable peak, so callers never treat
/// a failed fit as a zero correction.
pub fn combine_arms(fits: &[ArgMaxFit]) -> Option<ArgMaxFit> {
    let total: f64 = fits.iter().map(|f| f.probability).sum();
    if total <= 0.0 {
        return None;
    }
    let argmax = fits.iter().map(|f| f.argmax * f.probability).sum::<f64>() / total;
    let probability = fits
        .iter()
        .map(|f| f.probability)
        .fold(0.0, f64::max);
    Some(ArgMaxFit {
        argmax,
        probability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(-1.0, 1.0, 5);
        assert_eq!(values.len(), 5);
        assert_relative_eq!(values[0], -1.0);
        assert_relative_eq!(values[2], 0.0);
        assert_relative_eq!(values[4], 1.0);
        assert_eq!(linspace(2.0, 4.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_combine_arms_weights_by_probability() {
        let fits = [
            ArgMaxFit {
                argmax: 1.0,
                probability: 0.75,
            },
            ArgMaxFit {
                argmax: 3.0,
                probability: 0.25,
            },
        ];

        let combined = combine_arms(&fits).unwrap();
        assert_relative_eq!(combined.argmax, 1.5);
        assert_relative_eq!(combined.probability, 0.75);
    }

    #[test]
    fn test_combine_arms_without_evidence() {
        assert!(combine_arms(&[ArgMaxFit::FALLBACK, ArgMaxFit::FALLBACK]).is_none());
        assert!(combine_arms(&[]).is_none());
    }

    #[test]
    fn test_axis_names() {
        assert_eq!(Axis::XY.to_string(), "XY");
        assert_eq!(Axis::HeightPower.name(), "HP");
        assert!(Axis::Z.is_per_light_sheet());
        assert!(!Axis::Power.is_per_light_sheet());
    }
}
