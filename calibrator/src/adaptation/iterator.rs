//! Odometer-style iteration over an index grid

/// Visits every index tuple of a grid exactly once, first dimension fastest
///
/// A grid with any zero-sized dimension, or with no dimensions, is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdIterator {
    dims: Vec<usize>,
    current: Vec<usize>,
    exhausted: bool,
    visited: usize,
}

impl NdIterator {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            current: vec![0; dims.len()],
            exhausted: dims.is_empty() || dims.contains(&0),
            visited: 0,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of grid points
    pub fn total(&self) -> usize {
        if self.dims.is_empty() {
            0
        } else {
            self.dims.iter().product()
        }
    }

    /// Grid points returned so far
    pub fn visited(&self) -> usize {
        self.visited
    }

    pub fn has_next(&self) -> bool {
        !self.exhausted
    }

    /// Start over from the first grid point
    pub fn reset(&mut self) {
        *self = Self::new(&self.dims);
    }
}

impl Iterator for NdIterator {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.exhausted {
            return None;
        }
        let point = self.current.clone();
        self.visited += 1;

        let mut carry = true;
        for (index, &dim) in self.current.iter_mut().zip(&self.dims) {
            *index += 1;
            if *index < dim {
                carry = false;
                break;
            }
            *index = 0;
        }
        self.exhausted = carry;

        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total() - self.visited;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_dimension_fastest() {
        let points: Vec<Vec<usize>> = NdIterator::new(&[3, 2]).collect();

        assert_eq!(
            points,
            vec![
                vec![0, 0],
                vec![1, 0],
                vec![2, 0],
                vec![0, 1],
                vec![1, 1],
                vec![2, 1],
            ]
        );
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut it = NdIterator::new(&[2, 2]);
        assert_eq!(it.total(), 4);
        assert_eq!(it.by_ref().count(), 4);
        assert!(!it.has_next());
        assert_eq!(it.visited(), 4);
        assert_eq!(it.next(), None);

        it.reset();
        assert!(it.has_next());
        assert_eq!(it.size_hint(), (4, Some(4)));
    }

    #[test]
    fn test_empty_grids() {
        assert!(!NdIterator::new(&[]).has_next());
        assert!(!NdIterator::new(&[4, 0]).has_next());
        assert_eq!(NdIterator::new(&[4, 0]).count(), 0);
    }
}
