//! One-shot SIMD layout transform, run at model-preparation time.
//!
//! Eligible pointwise convolutions are rewritten in place so that all
//! backends consume the same memory layout the accelerator expects:
//! signed filter bytes interleaved in groups of 8 output channels, and a
//! bias that already carries the activation-shift compensation and the
//! rescaled output zero point. After this runs, the hot path performs a
//! single multiply-shift and no affine offset.
//!
//! Operators that fail any eligibility check are left untouched and keep
//! executing through the reference path.

use alloc::vec::Vec;

use crate::{EfpgaError, Shape4};

use super::quant::narrow_multiplier;
use super::{ConvParams, SIMD_LANES};

/// A pointwise convolution operator as the model loader hands it over:
/// unsigned filter storage, raw bias, untouched quantization parameters.
pub struct PointwiseConv {
    pub filter: Vec<u8>,
    pub filter_shape: Shape4,
    pub filter_zero_point: i32,
    pub bias: Vec<i32>,
    pub output_zero_point: i32,
    pub params: ConvParams,
    /// Set once the layout transform has run; the buffers are read-only
    /// from then on.
    pub prepared: bool,
}

/// Scratch selection: the transform borrows the largest read-write buffer
/// available, mirroring the linear scan over the tensor arena.
pub fn pick_scratch<'a, I>(candidates: I) -> Option<&'a mut [u8]>
where
    I: IntoIterator<Item = &'a mut [u8]>,
{
    candidates.into_iter().max_by_key(|buf| buf.len())
}

/// Why an operator stays on the reference path, if it does.
fn ineligible_reason(filter_shape: &Shape4, scratch_len: usize) -> Option<&'static str> {
    if filter_shape.dim(1) != 1 || filter_shape.dim(2) != 1 {
        return Some("filter is not 1x1xC");
    }
    if filter_shape.dim(0) % SIMD_LANES != 0 {
        return Some("filter count is not a multiple of 8");
    }
    if (SIMD_LANES * filter_shape.dim(3)) as usize > scratch_len {
        return Some("scratch area is too small");
    }
    None
}

/// Applies the full transform to one operator.
///
/// Returns `Ok(false)` without touching anything when the operator is not
/// eligible for acceleration. Must be called at most once per operator,
/// before any inference.
pub fn prepare_pointwise(
    filter: &mut [u8],
    filter_shape: &mut Shape4,
    filter_zero_point: i32,
    bias: &mut [i32],
    params: &mut ConvParams,
    output_zero_point: i32,
    scratch: &mut [u8],
) -> Result<bool, EfpgaError> {
    if let Some(reason) = ineligible_reason(filter_shape, scratch.len()) {
        debug!("skipping operator: {reason}");
        return Ok(false);
    }

    let num_filters = filter_shape.dim(0) as usize;
    let channels = filter_shape.dim(3) as usize;
    if filter.len() != num_filters * channels || bias.len() != num_filters {
        return Err(EfpgaError::ShapeMismatch);
    }

    // Convert filter storage to signed: subtract the zero point and clamp
    // into the legal i8 range.
    for byte in filter.iter_mut() {
        let val = (i32::from(*byte) - filter_zero_point).clamp(-128, 127);
        *byte = val as i8 as u8;
    }

    // The accelerator subtracts 128 from every activation unconditionally,
    // so pre-add sum(128 * filter) per output channel to compensate.
    for (f, b) in bias.iter_mut().enumerate() {
        for c in 0..channels {
            *b += 128 * i32::from(filter[f * channels + c] as i8);
        }
    }

    // Fold the output zero point into the bias, rescaled back through the
    // real-valued multiplier into the pre-quantization domain. This makes
    // the requantization linear instead of affine.
    if output_zero_point != 0 {
        let dscale = f64::from(params.output_multiplier) / f64::from(i32::MAX);
        let real_multiplier = dscale * pow2(params.output_shift);
        let delta = (f64::from(output_zero_point) / real_multiplier) as i32;
        for b in bias.iter_mut() {
            *b += delta;
        }
    }

    // Narrow the multiplier to the 16-bit form the datapath multiplies
    // with, and rebias the shift to match.
    params.output_multiplier = narrow_multiplier(params.output_multiplier);
    params.output_shift -= 5;

    // Interleave each block of 8 output channels: one byte from every
    // channel in the group, then the next input channel. Staged through
    // the scratch buffer, then copied back over the source block.
    let group_bytes = SIMD_LANES as usize * channels;
    let stage = &mut scratch[..group_bytes];
    for group in 0..num_filters / SIMD_LANES as usize {
        let base = group * group_bytes;
        for c in 0..channels {
            for lane in 0..SIMD_LANES as usize {
                stage[c * SIMD_LANES as usize + lane] = filter[base + lane * channels + c];
            }
        }
        filter[base..base + group_bytes].copy_from_slice(stage);
    }

    // The recorded filter count now counts SIMD groups.
    filter_shape.set_dim(0, (num_filters / SIMD_LANES as usize) as i32);
    debug!(
        "converted operator for acceleration: {} groups of {} channels",
        filter_shape.dim(0),
        channels
    );
    Ok(true)
}

/// Model-preparation trigger: runs once after tensor allocation, before
/// the first inference. Ineligible operators are skipped, not failed.
pub fn prepare_all(ops: &mut [PointwiseConv], scratch: &mut [u8]) -> Result<usize, EfpgaError> {
    let mut converted = 0;
    for op in ops.iter_mut() {
        if op.prepared {
            continue;
        }
        let done = prepare_pointwise(
            &mut op.filter,
            &mut op.filter_shape,
            op.filter_zero_point,
            &mut op.bias,
            &mut op.params,
            op.output_zero_point,
            scratch,
        )?;
        if done {
            op.prepared = true;
            converted += 1;
        }
    }
    Ok(converted)
}

fn pow2(exponent: i32) -> f64 {
    if exponent >= 0 {
        (1u64 << exponent) as f64
    } else {
        1.0 / (1u64 << -exponent) as f64
    }
}
