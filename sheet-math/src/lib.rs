//! sheet-math - Numeric algorithms for lightsheet calibration
//!
//! This crate provides the pure numeric pieces used by the calibration
//! modules, with no knowledge of devices or acquisition:
//!
//! - **Matrix** - 2x2 transforms between device units and sensor coordinates
//! - **Statistics** - median, percentile, smoothing and nearest-value search
//! - **Polynomial** - least-squares polynomial fitting and evaluation
//! - **ArgMax** - peak location with a confidence score for sampled curves
//! - **Layout** - placement of control planes along the detection axis
//!
//! # Example
//!
//! ```text
//! use sheet_math::{ArgMaxFinder, ParabolaArgMaxFinder};
//!
//! let x = [-2.0, -1.0, 0.0, 1.0, 2.0];
//! let y = [0.0, 3.0, 4.0, 3.0, 0.0];
//! let fit = ParabolaArgMaxFinder::default().argmax(&x, &y).unwrap();
//! assert!(fit.argmax.abs() < 1e-9);
//! ```

pub mod argmax;
pub mod layout;
pub mod matrix2;
pub mod polyfit;
pub mod stats;

// Re-export commonly used types
pub use argmax::{
    ArgMaxFinder, ArgMaxFit, CentroidArgMaxFinder, ParabolaArgMaxFinder, SmartArgMaxFinder,
};
pub use layout::ControlPlaneLayout;
pub use matrix2::{
    angle_between_vectors, invert_matrix, matrix_from_columns_checked, matrix_from_row_major,
    matrix_to_row_major, sheet_response, DegenerateVectorsError, SingularMatrixError,
};
pub use polyfit::{FitError, Polynomial};
pub use stats::{mean, median, nearest_index, percentile, smooth_in_place, StatsError};
