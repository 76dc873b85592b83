//! 4-D tensor shapes and the flattened-index addressing shared by every
//! convolution backend.
//!
//! All tensors handled by this crate are NHWC: `(batch, height, width,
//! channel)`. The accelerator, the SIMD software path and the reference
//! path must agree bit-for-bit on how a coordinate maps to a linear
//! offset, so that mapping lives here and nowhere else.

use crate::EfpgaError;

/// A 4-D shape with `i32` extents, NHWC for activations and
/// `(out_channel, filter_y, filter_x, in_channel)` for filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape4 {
    dims: [i32; 4],
}

impl Shape4 {
    pub const fn new(d0: i32, d1: i32, d2: i32, d3: i32) -> Self {
        Self {
            dims: [d0, d1, d2, d3],
        }
    }

    pub fn dim(&self, i: usize) -> i32 {
        self.dims[i]
    }

    /// Rewrites one extent in place. Used by the layout transform when the
    /// output-channel count collapses into SIMD groups.
    pub fn set_dim(&mut self, i: usize, value: i32) {
        self.dims[i] = value;
    }

    pub fn flat_size(&self) -> i32 {
        self.dims.iter().product()
    }

    /// Linear offset of `(b, y, x, c)`.
    ///
    /// Every backend addresses its input and output buffers through this
    /// single function; debug builds assert the coordinate is in range.
    pub fn offset(&self, b: i32, y: i32, x: i32, c: i32) -> usize {
        debug_assert!(b >= 0 && b < self.dims[0]);
        debug_assert!(y >= 0 && y < self.dims[1]);
        debug_assert!(x >= 0 && x < self.dims[2]);
        debug_assert!(c >= 0 && c < self.dims[3]);
        ((((b * self.dims[1] + y) * self.dims[2]) + x) as usize) * self.dims[3] as usize
            + c as usize
    }
}

/// Returns the shared extent of `a.dim(ai)` and `b.dim(bi)`, or
/// `ShapeMismatch` if the two disagree.
pub fn matching_dim(a: &Shape4, ai: usize, b: &Shape4, bi: usize) -> Result<i32, EfpgaError> {
    if a.dim(ai) != b.dim(bi) {
        return Err(EfpgaError::ShapeMismatch);
    }
    Ok(a.dim(ai))
}
