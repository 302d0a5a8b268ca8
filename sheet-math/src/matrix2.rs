//! Light-sheet XY response matrices
//!
//! The XY calibration describes how the light sheet moves on the detector
//! when its X and Y control functions are driven by one unit. Those two
//! response vectors form the columns of a 2x2 matrix whose inverse turns a
//! measured sensor offset back into a device correction.

use nalgebra::{Matrix2, Vector2};
use thiserror::Error;

/// The response matrix cannot be inverted
#[derive(Error, Debug, Clone, PartialEq)]
#[error("singular response matrix: determinant={determinant:.6e}")]
pub struct SingularMatrixError {
    pub determinant: f64,
}

/// X and Y responses point in (nearly) the same direction
#[derive(Error, Debug, Clone, PartialEq)]
#[error("X and Y responses are only {angle_degrees:.2}° apart")]
pub struct DegenerateVectorsError {
    pub angle_degrees: f64,
}

/// Determinants below this, relative to the squared matrix scale, are singular
const RELATIVE_DETERMINANT_EPSILON: f64 = 1e-10;

/// Invert a response matrix
///
/// The singularity test is relative to the size of the entries, so a
/// response measured in small units is not rejected for being small.
pub fn invert_matrix(matrix: &Matrix2<f64>) -> Result<Matrix2<f64>, SingularMatrixError> {
    let (a, b, c, d) = (matrix[(0, 0)], matrix[(0, 1)], matrix[(1, 0)], matrix[(1, 1)]);
    let determinant = a * d - b * c;
    let scale = matrix.norm_squared();

    if !determinant.is_finite()
        || scale == 0.0
        || determinant.abs() <= RELATIVE_DETERMINANT_EPSILON * scale
    {
        return Err(SingularMatrixError { determinant });
    }

    Ok(Matrix2::new(d, -b, -c, a) / determinant)
}

/// Unsigned angle between two vectors in degrees, `0` if either is zero
pub fn angle_between_vectors(v1: &Vector2<f64>, v2: &Vector2<f64>) -> f64 {
    if v1.norm_squared() == 0.0 || v2.norm_squared() == 0.0 {
        return 0.0;
    }
    let cross = v1.x * v2.y - v1.y * v2.x;
    cross.abs().atan2(v1.dot(v2)).to_degrees()
}

/// Response matrix with `x_response` and `y_response` as columns
///
/// Rejects responses closer than `min_angle_degrees` to parallel or
/// anti-parallel; such a matrix would amplify centroid noise on inversion.
pub fn matrix_from_columns_checked(
    x_response: Vector2<f64>,
    y_response: Vector2<f64>,
    min_angle_degrees: f64,
) -> Result<Matrix2<f64>, DegenerateVectorsError> {
    let angle = angle_between_vectors(&x_response, &y_response);
    if angle < min_angle_degrees || angle > 180.0 - min_angle_degrees {
        return Err(DegenerateVectorsError {
            angle_degrees: angle,
        });
    }
    Ok(Matrix2::from_columns(&[x_response, y_response]))
}

/// Response of a sheet whose X/Y axes are rotated by `angle_rad` on the
/// detector and scaled by `gain_x` / `gain_y`
pub fn sheet_response(angle_rad: f64, gain_x: f64, gain_y: f64) -> Matrix2<f64> {
    let (s, c) = angle_rad.sin_cos();
    Matrix2::new(c * gain_x, -s * gain_y, s * gain_x, c * gain_y)
}

/// Flatten a matrix as row-major `[m00, m01, m10, m11]` for persistence
pub fn matrix_to_row_major(matrix: &Matrix2<f64>) -> [f64; 4] {
    [
        matrix[(0, 0)],
        matrix[(0, 1)],
        matrix[(1, 0)],
        matrix[(1, 1)],
    ]
}

/// Rebuild a matrix from row-major `[m00, m01, m10, m11]`
pub fn matrix_from_row_major(values: &[f64; 4]) -> Matrix2<f64> {
    Matrix2::new(values[0], values[1], values[2], values[3])
}
