use std::fmt;

use crate::error::{Error, Result};

// Shape: N-dimensional shape representation
//
// A Shape lists the size of each dimension in the order the tensor is stored:
//   - Scalar: Shape([])              0 dimensions, 1 element
//   - Matrix: Shape([3, 4])          12 elements
//   - NHWC:   Shape([2, 5, 5, 3])    channels last, as stored
//   - Empty:  Shape([0, 3, 8, 8])    zero batch, 0 elements
//
// The shape alone determines element count and the contiguous row-major
// strides of a freshly allocated buffer.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar has 1 element, any zero dimension
    /// gives 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Contiguous (row-major / C-order) strides.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d as i64,
            rank: self.rank(),
        })
    }

    /// Normalise a possibly-negative axis against this rank.
    pub fn normalize_axis(&self, axis: i64) -> Result<usize> {
        let rank = self.rank() as i64;
        let a = if axis < 0 { axis + rank } else { axis };
        if a < 0 || a >= rank {
            return Err(Error::DimOutOfRange {
                dim: axis,
                rank: self.rank(),
            });
        }
        Ok(a as usize)
    }

    /// Product of the dimensions strictly after `axis` (the stride of `axis`
    /// in a contiguous buffer).
    pub fn inner_size(&self, axis: usize) -> usize {
        self.0[axis + 1..].iter().product()
    }

    /// Product of the dimensions strictly before `axis`.
    pub fn outer_size(&self, axis: usize) -> usize {
        self.0[..axis].iter().product()
    }

    // Broadcasting

    /// NumPy-style broadcast of two shapes aligned on trailing dimensions.
    ///
    ///   [3, 4] and [4]        → [3, 4]
    ///   [2, 1] and [1, 3]     → [2, 3]
    ///   [5, 3, 1] and [3, 4]  → [5, 3, 4]
    ///   [3] and [4]           → ShapeMismatch
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            result.push(broadcast_dim(lhs, rhs, ld, rd, i)?);
        }

        result.reverse();
        Ok(Shape::new(result))
    }
}

/// Broadcast a single aligned pair of dimensions.
pub(crate) fn broadcast_dim(lhs: &Shape, rhs: &Shape, ld: usize, rd: usize, pos: usize) -> Result<usize> {
    if ld == rd || rd == 1 {
        Ok(ld)
    } else if ld == 1 {
        Ok(rd)
    } else {
        Err(Error::ShapeMismatch {
            lhs: lhs.clone(),
            rhs: rhs.clone(),
            reason: format!("dim {pos} from the right: {ld} vs {rd}"),
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.stride_contiguous(), Vec::<usize>::new());
    }

    #[test]
    fn test_zero_batch_has_no_elements() {
        let s = Shape::from((0, 3, 8, 8));
        assert_eq!(s.elem_count(), 0);
        assert_eq!(s.stride_contiguous(), vec![192, 64, 8, 1]);
    }

    #[test]
    fn test_3d_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(s.inner_size(0), 12);
        assert_eq!(s.outer_size(2), 6);
    }

    #[test]
    fn test_normalize_axis() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.normalize_axis(-1).unwrap(), 2);
        assert_eq!(s.normalize_axis(0).unwrap(), 0);
        assert!(s.normalize_axis(3).is_err());
        assert!(s.normalize_axis(-4).is_err());
    }

    #[test]
    fn test_broadcast() {
        let out = Shape::broadcast_shape(&Shape::from((5, 3, 1)), &Shape::from((3, 4))).unwrap();
        assert_eq!(out.dims(), &[5, 3, 4]);
        let err = Shape::broadcast_shape(&Shape::from(3), &Shape::from(4)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
