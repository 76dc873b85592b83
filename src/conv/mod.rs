//! Quantized 2-D convolution: parameters, the backend seam and the three
//! interchangeable kernel implementations.
//!
//! All three backends implement [`ConvKernel`] over the same buffers and
//! must produce identical quantized outputs for the same operator. Which
//! one a binary uses is a link-time choice; nothing switches backends at
//! runtime.

use crate::{EfpgaError, Shape4};

pub mod prepare;
pub mod quant;
pub mod reference;
pub mod simd;

/// Number of output channels computed in lockstep by the SIMD grouping and
/// by the accelerator datapath.
pub const SIMD_LANES: i32 = 8;

/// Per-operator convolution parameters, fixed at model-preparation time.
///
/// `output_multiplier` and `output_shift` encode the real-valued rescaling
/// factor `(input_scale * filter_scale) / output_scale` as
/// `multiplier * 2^output_shift`, with `output_shift` negative for a right
/// shift. After the SIMD layout transform the multiplier holds the narrowed
/// 16-bit form consumed by the approximate requantizer.
#[derive(Clone, Copy, Debug)]
pub struct ConvParams {
    pub stride_width: i32,
    pub stride_height: i32,
    pub dilation_width_factor: i32,
    pub dilation_height_factor: i32,
    pub pad_width: i32,
    pub pad_height: i32,
    pub input_offset: i32,
    pub weights_offset: i32,
    pub output_offset: i32,
    pub output_multiplier: i32,
    pub output_shift: i32,
    pub output_activation_min: i32,
    pub output_activation_max: i32,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            stride_width: 1,
            stride_height: 1,
            dilation_width_factor: 1,
            dilation_height_factor: 1,
            pad_width: 0,
            pad_height: 0,
            input_offset: 0,
            weights_offset: 0,
            output_offset: 0,
            output_multiplier: 0,
            output_shift: 0,
            output_activation_min: 0,
            output_activation_max: 255,
        }
    }
}

/// Descriptor handed to a backend for one invocation: shapes plus the
/// caller-owned data buffers. `filter` is raw bytes whose interpretation
/// depends on the backend: unsigned zero-point-biased storage for the
/// reference path, signed SIMD-grouped storage after the layout transform.
pub struct ConvArgs<'a> {
    pub input_shape: Shape4,
    pub input: &'a [u8],
    pub filter_shape: Shape4,
    pub filter: &'a [u8],
    pub bias: Option<&'a [i32]>,
    pub output_shape: Shape4,
}

/// The backend seam. One implementation per execution mode: pure-software
/// reference, software with SIMD grouping, and hardware offload.
pub trait ConvKernel {
    fn conv(
        &self,
        params: &ConvParams,
        args: &ConvArgs<'_>,
        output: &mut [u8],
    ) -> Result<(), EfpgaError>;
}

/// Common entry validation: rank is fixed at 4 by construction, so the
/// checks left are the activation-range invariant and buffer sizing.
pub(crate) fn check_invocation(
    params: &ConvParams,
    args: &ConvArgs<'_>,
    output: &mut [u8],
) -> Result<(), EfpgaError> {
    if params.output_activation_min > params.output_activation_max {
        return Err(EfpgaError::InvalidArgument);
    }
    if args.input.len() < args.input_shape.flat_size() as usize
        || output.len() < args.output_shape.flat_size() as usize
    {
        return Err(EfpgaError::ShapeMismatch);
    }
    Ok(())
}
