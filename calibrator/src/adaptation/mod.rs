//! Per-control-plane adaptation of light-sheet corrections
//!
//! Where the axis calibrations fit one function per light sheet, adaptation
//! measures a correction at every control plane and stores it in the
//! [`InterpolatedAcquisitionState`](shared::microscope::InterpolatedAcquisitionState)
//! tables that acquisition interpolates between.

pub mod engine;
pub mod iterator;
pub mod results;
pub mod standard;
pub mod variants;

pub use engine::AdaptiveEngine;
pub use iterator::NdIterator;
pub use results::{FitResult, ResultIndexError, ResultTable};
pub use standard::{AdaptationSettings, StandardAdaptationModule, StepContext};
pub use variants::{AdaptationA, AdaptationVariant, AdaptationW, AdaptationZ};

use shared::microscope::{DeviceError, TableError, TaskConflict};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdaptationError {
    #[error(transparent)]
    Busy(#[from] TaskConflict),

    #[error("adaptation module '{0}' has not finished its grid")]
    NotReady(String),

    #[error("adaptation module '{0}' was stepped before being reset")]
    NotReset(String),

    #[error("interpolation table error: {0}")]
    Table(#[from] TableError),

    #[error(transparent)]
    Results(#[from] ResultIndexError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}
