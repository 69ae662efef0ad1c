use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::shape::Shape;

// DataLayout: Semantic ordering of image-like tensors
//
// A tensor's shape is always listed in storage order. DataLayout names what
// those dimensions mean, which is what kernels and the dispatch table care
// about:
//
//   Plain    generic row-major tensor, no channel semantics
//   Nchw     [N, C, H, W]        channel-first 2-D
//   Nhwc     [N, H, W, C]        channel-last 2-D
//   Ncdhw    [N, C, D, H, W]     channel-first 3-D
//   Ndhwc    [N, D, H, W, C]     channel-last 3-D

/// Memory ordering convention of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum DataLayout {
    #[default]
    Plain,
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
}

impl DataLayout {
    pub fn is_channel_last(&self) -> bool {
        matches!(self, DataLayout::Nhwc | DataLayout::Ndhwc)
    }

    /// Number of spatial dimensions, if the layout has channel semantics.
    pub fn spatial_rank(&self) -> Option<usize> {
        match self {
            DataLayout::Plain => None,
            DataLayout::Nchw | DataLayout::Nhwc => Some(2),
            DataLayout::Ncdhw | DataLayout::Ndhwc => Some(3),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataLayout::Plain => "PLAIN",
            DataLayout::Nchw => "NCHW",
            DataLayout::Nhwc => "NHWC",
            DataLayout::Ncdhw => "NCDHW",
            DataLayout::Ndhwc => "NDHWC",
        }
    }

    /// Permutation taking a channel-last buffer of `rank` dims to
    /// channel-first: [0, rank-1, 1, .., rank-2].
    pub fn to_channel_first_perm(rank: usize) -> Vec<usize> {
        let mut perm = Vec::with_capacity(rank);
        perm.push(0);
        perm.push(rank - 1);
        perm.extend(1..rank - 1);
        perm
    }

    /// Inverse of [`DataLayout::to_channel_first_perm`]: [0, 2, .., rank-1, 1].
    pub fn to_channel_last_perm(rank: usize) -> Vec<usize> {
        let mut perm = Vec::with_capacity(rank);
        perm.push(0);
        perm.extend(2..rank);
        perm.push(1);
        perm
    }
}

impl fmt::Display for DataLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAIN" | "ANY" | "" => Ok(DataLayout::Plain),
            "NCHW" => Ok(DataLayout::Nchw),
            "NHWC" => Ok(DataLayout::Nhwc),
            "NCDHW" => Ok(DataLayout::Ncdhw),
            "NDHWC" => Ok(DataLayout::Ndhwc),
            other => Err(Error::invalid(format!("unknown data layout '{other}'"))),
        }
    }
}

// Layout: Shape + strides + offset view over flat storage
//
// Decouples the logical shape of a tensor from where its elements live. A
// permutation only reorders shape and strides; walking the view with
// `strided_indices()` yields the source offsets in the permuted logical
// order, which is how the transpose kernel gathers its output.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Contiguous row-major layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Reorder dimensions: output dim `i` is input dim `perm[i]`.
    /// No data is moved.
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        validate_perm(perm, rank)?;
        let dims = perm.iter().map(|&p| self.shape.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// flat_index = offset + sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterator over all flat storage indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Check that `perm` is a permutation of `0..rank`.
pub fn validate_perm(perm: &[usize], rank: usize) -> Result<()> {
    if perm.len() != rank {
        return Err(Error::invalid(format!(
            "permutation {perm:?} has {} entries for a rank-{rank} tensor",
            perm.len()
        )));
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || seen[p] {
            return Err(Error::invalid(format!(
                "{perm:?} is not a permutation of 0..{rank}"
            )));
        }
        seen[p] = true;
    }
    Ok(())
}

/// Inverse permutation: `inv[perm[i]] = i`.
pub fn inverse_perm(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

// StridedIter: Flat storage indices in logical order
//
// For a contiguous layout this counts 0, 1, 2, ...; for a permuted view it
// jumps through storage following the strides.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    /// Advance the multi-dimensional index by one (rightmost dimension first).
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
