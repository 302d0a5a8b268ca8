//! Control-plane placement along the detection axis
//!
//! Control planes are indexed `0..n` and mapped to a normalized position in
//! `[0, 1]`. Corrections are calibrated at each plane and interpolated
//! between them at acquisition time.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlPlaneLayout {
    /// Evenly spaced planes
    #[default]
    Linear,
    /// Planes packed towards both ends of the range
    Circular,
}

impl ControlPlaneLayout {
    /// Normalized position of control plane `index` out of `count`
    ///
    /// A single plane sits at the middle of the range.
    pub fn layout(&self, count: usize, index: usize) -> f64 {
        if count < 2 {
            return 0.5;
        }
        let linear = index as f64 / (count - 1) as f64;
        match self {
            ControlPlaneLayout::Linear => linear,
            ControlPlaneLayout::Circular => 0.5 * (1.0 + (PI * (1.0 - linear)).cos()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_endpoints_for_both_layouts() {
        for layout in [ControlPlaneLayout::Linear, ControlPlaneLayout::Circular] {
            for n in 2..12 {
                assert_relative_eq!(layout.layout(n, 0), 0.0, epsilon = 1e-12);
                assert_relative_eq!(layout.layout(n, n - 1), 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_layouts_are_monotonic() {
        for layout in [ControlPlaneLayout::Linear, ControlPlaneLayout::Circular] {
            for n in 2..12 {
                for i in 1..n {
                    assert!(layout.layout(n, i) > layout.layout(n, i - 1));
                }
            }
        }
    }

    #[test]
    fn test_circular_matches_cosine_formula() {
        let n = 5;
        for i in 0..n {
            let linear = ControlPlaneLayout::Linear.layout(n, i);
            let expected = 0.5 * (1.0 + (PI * (1.0 - linear)).cos());
            assert_relative_eq!(ControlPlaneLayout::Circular.layout(n, i), expected);
        }
        assert_relative_eq!(ControlPlaneLayout::Linear.layout(5, 1), 0.25);
        assert_relative_eq!(ControlPlaneLayout::Circular.layout(5, 2), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_single_plane_is_centered() {
        assert_eq!(ControlPlaneLayout::Circular.layout(1, 0), 0.5);
    }
}
