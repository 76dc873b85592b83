//! Software backend over the SIMD-grouped layout.
//!
//! Consumes the filter and bias buffers produced by the layout transform:
//! signed filter bytes interleaved in groups of [`SIMD_LANES`] output
//! channels, bias carrying the folded `input - 128` compensation and the
//! rescaled output zero point. The requantization here is the narrow
//! 16-bit pipeline, bit-for-bit what the accelerator computes; this is
//! also the function the hardware cross-check uses to build its expected
//! output.

use crate::shape::matching_dim;
use crate::EfpgaError;

use super::quant::{clamp_activation, requantize_narrow};
use super::{check_invocation, ConvArgs, ConvKernel, ConvParams, SIMD_LANES};

pub struct SimdKernel;

impl ConvKernel for SimdKernel {
    fn conv(
        &self,
        params: &ConvParams,
        args: &ConvArgs<'_>,
        output: &mut [u8],
    ) -> Result<(), EfpgaError> {
        conv_simd(params, args, output)
    }
}

/// Position of one filter tap in the grouped layout: one byte from each of
/// the 8 channels in a group, then the next input channel.
pub fn grouped_filter_index(group: i32, in_channel: i32, input_depth: i32, lane: i32) -> usize {
    (((group * input_depth + in_channel) * SIMD_LANES) + lane) as usize
}

pub fn conv_simd(
    params: &ConvParams,
    args: &ConvArgs<'_>,
    output: &mut [u8],
) -> Result<(), EfpgaError> {
    check_invocation(params, args, output)?;

    let batches = matching_dim(&args.input_shape, 0, &args.output_shape, 0)?;
    let input_depth = matching_dim(&args.input_shape, 3, &args.filter_shape, 3)?;
    // Filter dim 0 counts SIMD groups after the layout transform.
    let output_groups = args.filter_shape.dim(0);
    if output_groups * SIMD_LANES != args.output_shape.dim(3) {
        return Err(EfpgaError::ShapeMismatch);
    }
    // Grouped storage carries 8 lanes per recorded filter "row".
    if args.filter.len()
        < (output_groups * args.filter_shape.dim(1) * args.filter_shape.dim(2) * input_depth
            * SIMD_LANES) as usize
    {
        return Err(EfpgaError::ShapeMismatch);
    }
    if let Some(bias) = args.bias {
        if bias.len() != (output_groups * SIMD_LANES) as usize {
            return Err(EfpgaError::ShapeMismatch);
        }
    }

    let input_height = args.input_shape.dim(1);
    let input_width = args.input_shape.dim(2);
    let filter_height = args.filter_shape.dim(1);
    let filter_width = args.filter_shape.dim(2);
    let output_height = args.output_shape.dim(1);
    let output_width = args.output_shape.dim(2);

    let multiplier = params.output_multiplier as i16;
    let shift = -params.output_shift;

    for batch in 0..batches {
        for out_y in 0..output_height {
            for out_x in 0..output_width {
                let in_x_origin = out_x * params.stride_width - params.pad_width;
                let in_y_origin = out_y * params.stride_height - params.pad_height;
                for group in 0..output_groups {
                    for lane in 0..SIMD_LANES {
                        let mut acc: i32 = 0;
                        for filter_y in 0..filter_height {
                            for filter_x in 0..filter_width {
                                let in_x =
                                    in_x_origin + params.dilation_width_factor * filter_x;
                                let in_y =
                                    in_y_origin + params.dilation_height_factor * filter_y;
                                if in_x < 0
                                    || in_x >= input_width
                                    || in_y < 0
                                    || in_y >= input_height
                                {
                                    continue;
                                }
                                for in_channel in 0..input_depth {
                                    let filter_val = i32::from(
                                        args.filter[grouped_filter_index(
                                            group,
                                            in_channel,
                                            input_depth,
                                            lane,
                                        )] as i8,
                                    );
                                    let input_val = i32::from(
                                        args.input[args
                                            .input_shape
                                            .offset(batch, in_y, in_x, in_channel)],
                                    );
                                    // The accelerator shifts activations to
                                    // the signed domain unconditionally.
                                    acc += filter_val * (input_val - 128);
                                }
                            }
                        }
                        if let Some(bias) = args.bias {
                            // Folded at prepare time: zero-point correction
                            // and output offset both live here already.
                            acc += bias[(group * SIMD_LANES + lane) as usize];
                        }
                        let mut out_val = requantize_narrow(acc, multiplier, shift);
                        out_val = clamp_activation(
                            out_val,
                            params.output_activation_min,
                            params.output_activation_max,
                        );
                        output[args.output_shape.offset(
                            batch,
                            out_y,
                            out_x,
                            group * SIMD_LANES + lane,
                        )] = out_val as u8;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shape4;
    use alloc::vec;

    #[test]
    fn grouped_index_interleaves_lanes_within_a_group() {
        let depth = 4;
        // lane varies fastest, then input channel, then group.
        assert_eq!(grouped_filter_index(0, 0, depth, 0), 0);
        assert_eq!(grouped_filter_index(0, 0, depth, 7), 7);
        assert_eq!(grouped_filter_index(0, 1, depth, 0), 8);
        assert_eq!(grouped_filter_index(1, 0, depth, 0), 32);
        assert_eq!(grouped_filter_index(2, 3, depth, 5), (2 * 4 + 3) * 8 + 5);
    }

    #[test]
    fn centered_input_yields_pure_bias_output() {
        // Activations at 128 are signed zero, so only the bias reaches the
        // requantizer. multiplier 1<<14 with shift 0: bias 1<<22 yields
        // ((1<<22 >> 0) as i16 wraps...) -- keep bias small instead:
        // acc = 4096 -> (4096 * 16384) >> 16 >> 4 = 64.
        let params = ConvParams {
            output_multiplier: 16384,
            output_shift: 0,
            ..ConvParams::default()
        };
        let bias = vec![4096i32; 8];
        let args = ConvArgs {
            input_shape: Shape4::new(1, 1, 1, 4),
            input: &[128, 128, 128, 128],
            filter_shape: Shape4::new(1, 1, 1, 4),
            filter: &[3u8.wrapping_neg(); 32], // arbitrary signed taps, all unused
            bias: Some(&bias),
            output_shape: Shape4::new(1, 1, 1, 8),
        };
        let mut out = vec![0u8; 8];
        conv_simd(&params, &args, &mut out).unwrap();
        assert_eq!(out, vec![64u8; 8]);
    }

    #[test]
    fn lanes_accumulate_independently() {
        // Filter group where lane k has weight +k on the single input
        // channel; input signed +2.
        let mut filter = [0u8; 8];
        for (lane, byte) in filter.iter_mut().enumerate() {
            *byte = lane as u8; // small positives, same bits as i8
        }
        let params = ConvParams {
            output_multiplier: 16384,
            output_shift: -6,
            ..ConvParams::default()
        };
        let args = ConvArgs {
            input_shape: Shape4::new(1, 1, 1, 1),
            input: &[130],
            filter_shape: Shape4::new(1, 1, 1, 1),
            filter: &filter,
            bias: None,
            output_shape: Shape4::new(1, 1, 1, 8),
        };
        let mut out = vec![0u8; 8];
        conv_simd(&params, &args, &mut out).unwrap();
        // acc = 2k, shift 6 truncates small accumulators to zero.
        assert_eq!(out, vec![0u8; 8]);

        // Re-run with a shift that keeps the product visible:
        // acc = 2k -> (2k * 16384) >> 16 >> 4 with shift 0.
        let params = ConvParams {
            output_multiplier: 16384,
            output_shift: 0,
            ..params
        };
        conv_simd(&params, &args, &mut out).unwrap();
        let expect: alloc::vec::Vec<u8> = (0..8i32).map(|k| ((2 * k * 16384) >> 20) as u8).collect();
        assert_eq!(out, expect);
    }

    #[test]
    fn short_filter_buffer_is_rejected() {
        // One group of 8 lanes over 2 input channels needs 16 grouped
        // bytes; 8 must fail cleanly instead of indexing past the end.
        let params = ConvParams::default();
        let args = ConvArgs {
            input_shape: Shape4::new(1, 1, 1, 2),
            input: &[128, 128],
            filter_shape: Shape4::new(1, 1, 1, 2),
            filter: &[0; 8],
            bias: None,
            output_shape: Shape4::new(1, 1, 1, 8),
        };
        let mut out = vec![0u8; 8];
        assert_eq!(
            conv_simd(&params, &args, &mut out),
            Err(EfpgaError::ShapeMismatch)
        );
    }

    #[test]
    fn group_count_must_match_output_depth() {
        let params = ConvParams::default();
        let args = ConvArgs {
            input_shape: Shape4::new(1, 1, 1, 1),
            input: &[128],
            filter_shape: Shape4::new(2, 1, 1, 1), // 2 groups = 16 channels
            filter: &[0; 16],
            bias: None,
            output_shape: Shape4::new(1, 1, 1, 8),
        };
        let mut out = vec![0u8; 8];
        assert_eq!(
            conv_simd(&params, &args, &mut out),
            Err(EfpgaError::ShapeMismatch)
        );
    }
}
