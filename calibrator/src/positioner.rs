//! Light-sheet positioners
//!
//! A positioner maps between light-sheet control X/Y and normalized sensor
//! coordinates of one detection arm, using the linear part of the XY
//! calibration transform. Acquisition tools use it to place a sheet at a
//! chosen image position.

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use sheet_math::{invert_matrix, matrix_from_row_major, matrix_to_row_major, SingularMatrixError};

/// Linear control-to-sensor map of one (light sheet, detection arm)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightSheetPositioner {
    /// Row-major control-to-sensor matrix
    pub matrix: [f64; 4],
}

impl LightSheetPositioner {
    pub fn new(matrix: &Matrix2<f64>) -> Self {
        Self {
            matrix: matrix_to_row_major(matrix),
        }
    }

    pub fn identity() -> Self {
        Self::new(&Matrix2::identity())
    }

    pub fn transform(&self) -> Matrix2<f64> {
        matrix_from_row_major(&self.matrix)
    }

    /// Sensor displacement produced by a control displacement
    pub fn to_sensor(&self, control: Vector2<f64>) -> Vector2<f64> {
        self.transform() * control
    }

    /// Control displacement needed for a sensor displacement
    pub fn to_control(&self, sensor: Vector2<f64>) -> Result<Vector2<f64>, SingularMatrixError> {
        Ok(invert_matrix(&self.transform())? * sensor)
    }
}

impl Default for LightSheetPositioner {
    fn default() -> Self {
        Self::identity()
    }
}
