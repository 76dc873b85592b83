//! Pure-software reference backend.
//!
//! Operates on the untransformed model layout: unsigned zero-point-biased
//! filter bytes, per-output-channel contiguous, with the canonical rounding
//! requantization and an affine output offset. Operators the layout
//! transform skips keep executing through this path.

use crate::shape::matching_dim;
use crate::EfpgaError;

use super::quant::{clamp_activation, multiply_by_quantized_multiplier};
use super::{check_invocation, ConvArgs, ConvKernel, ConvParams};

pub struct ReferenceKernel;

impl ConvKernel for ReferenceKernel {
    fn conv(
        &self,
        params: &ConvParams,
        args: &ConvArgs<'_>,
        output: &mut [u8],
    ) -> Result<(), EfpgaError> {
        conv_reference(params, args, output)
    }
}

pub fn conv_reference(
    params: &ConvParams,
    args: &ConvArgs<'_>,
    output: &mut [u8],
) -> Result<(), EfpgaError> {
    check_invocation(params, args, output)?;

    let batches = matching_dim(&args.input_shape, 0, &args.output_shape, 0)?;
    let input_depth = matching_dim(&args.input_shape, 3, &args.filter_shape, 3)?;
    let output_depth = matching_dim(&args.filter_shape, 0, &args.output_shape, 3)?;
    if args.filter.len() < args.filter_shape.flat_size() as usize {
        return Err(EfpgaError::ShapeMismatch);
    }
    if let Some(bias) = args.bias {
        if bias.len() != output_depth as usize {
            return Err(EfpgaError::ShapeMismatch);
        }
    }

    let input_height = args.input_shape.dim(1);
    let input_width = args.input_shape.dim(2);
    let filter_height = args.filter_shape.dim(1);
    let filter_width = args.filter_shape.dim(2);
    let output_height = args.output_shape.dim(1);
    let output_width = args.output_shape.dim(2);

    for batch in 0..batches {
        for out_y in 0..output_height {
            for out_x in 0..output_width {
                let in_x_origin = out_x * params.stride_width - params.pad_width;
                let in_y_origin = out_y * params.stride_height - params.pad_height;
                for out_channel in 0..output_depth {
                    let mut acc: i32 = 0;
                    for filter_y in 0..filter_height {
                        for filter_x in 0..filter_width {
                            let in_x = in_x_origin + params.dilation_width_factor * filter_x;
                            let in_y = in_y_origin + params.dilation_height_factor * filter_y;
                            // Locations outside the input image contribute
                            // nothing (implicit zero padding).
                            if in_x < 0 || in_x >= input_width || in_y < 0 || in_y >= input_height
                            {
                                continue;
                            }
                            for in_channel in 0..input_depth {
                                let input_val = i32::from(
                                    args.input
                                        [args.input_shape.offset(batch, in_y, in_x, in_channel)],
                                );
                                let filter_val = i32::from(
                                    args.filter[args.filter_shape.offset(
                                        out_channel,
                                        filter_y,
                                        filter_x,
                                        in_channel,
                                    )],
                                );
                                acc += (filter_val + params.weights_offset)
                                    * (input_val + params.input_offset);
                            }
                        }
                    }
                    if let Some(bias) = args.bias {
                        acc += bias[out_channel as usize];
                    }
                    acc = multiply_by_quantized_multiplier(
                        acc,
                        params.output_multiplier,
                        params.output_shift,
                    );
                    acc += params.output_offset;
                    acc = clamp_activation(
                        acc,
                        params.output_activation_min,
                        params.output_activation_max,
                    );
                    output[args.output_shape.offset(batch, out_y, out_x, out_channel)] = acc as u8;
                }
            }
        }
    }
    Ok(())
}
