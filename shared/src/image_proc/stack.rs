//! Planar image stacks

use ndarray::{stack, Array2, Array3, ArrayView2, Axis, ShapeError};

/// A stack of `u16` planes indexed `(plane, row, column)`
///
/// A detection arm that captured no frame in a queue returns an empty stack
/// rather than an error, so sweeps over several arms can skip it.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageStack {
    data: Array3<u16>,
}

impl ImageStack {
    pub fn new(data: Array3<u16>) -> Self {
        Self { data }
    }

    /// Placeholder stack with no planes
    pub fn empty() -> Self {
        Self {
            data: Array3::zeros((0, 0, 0)),
        }
    }

    /// Stack equally-shaped planes along a new leading axis
    pub fn from_planes(planes: &[Array2<u16>]) -> Result<Self, ShapeError> {
        if planes.is_empty() {
            return Ok(Self::empty());
        }
        let views: Vec<ArrayView2<u16>> = planes.iter().map(|p| p.view()).collect();
        Ok(Self::new(stack(Axis(0), &views)?))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn num_planes(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// `(height, width)` of each plane
    pub fn plane_shape(&self) -> (usize, usize) {
        let (_, h, w) = self.data.dim();
        (h, w)
    }

    pub fn plane(&self, index: usize) -> ArrayView2<'_, u16> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn planes(&self) -> impl Iterator<Item = ArrayView2<'_, u16>> {
        self.data.outer_iter()
    }

    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    /// Size of the pixel buffer in bytes
    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<u16>()
    }
}
