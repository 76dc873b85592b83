//! Fixed-point requantization.
//!
//! Two distinct pipelines map a 32-bit accumulator to an 8-bit output:
//!
//! * the canonical rounding rescale used by the reference backend
//!   (saturating-doubling high multiply followed by a rounding
//!   power-of-two divide);
//! * the reduced-precision narrow rescale that mirrors what the eFPGA
//!   datapath computes in native 16-bit arithmetic. The SIMD software
//!   backend replicates it bit-for-bit so the hardware cross-check can
//!   report zero divergence.

/// `a * b` as a Q31 high product with rounding, saturating only on the
/// single overflowing input pair `(i32::MIN, i32::MIN)`.
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let ab = i64::from(a) * i64::from(b);
    let nudge: i64 = if ab >= 0 { 1 << 30 } else { 1 - (1 << 30) };
    // Truncating division, not an arithmetic shift: the two differ by one
    // for negative products.
    ((ab + nudge) / (1i64 << 31)) as i32
}

/// Divide by `2^exponent` rounding to nearest, ties away from zero.
pub fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    debug_assert!((0..=31).contains(&exponent));
    let mask = (1i64 << exponent) - 1;
    let remainder = i64::from(x) & mask;
    let threshold = (mask >> 1) + i64::from(x < 0);
    (x >> exponent) + i32::from(remainder > threshold)
}

/// Canonical fixed-point rescale: `x * multiplier * 2^shift` with rounding,
/// `shift < 0` meaning a right shift.
pub fn multiply_by_quantized_multiplier(x: i32, quantized_multiplier: i32, shift: i32) -> i32 {
    let left_shift = shift.max(0);
    let right_shift = (-shift).max(0);
    rounding_divide_by_pot(
        saturating_rounding_doubling_high_mul(x << left_shift, quantized_multiplier),
        right_shift,
    )
}

/// The narrow rescale the accelerator implements.
///
/// The accumulator is right-shifted into (at most) 16 significant bits, the
/// low 16 bits of that are multiplied by the 16-bit multiplier, and the
/// high halfword of the product is shifted right 4 more bits. There is no
/// saturation ahead of either 16-bit truncation: a shifted accumulator that
/// does not fit in 16 bits wraps, exactly as the hardware wraps. `shift`
/// must already be the positive right-shift count (`-output_shift`).
pub fn requantize_narrow(acc: i32, multiplier: i16, shift: i32) -> i32 {
    let shifted = (acc >> shift) as i16;
    let product = i32::from(multiplier) * i32::from(shifted);
    let high = (product >> 16) as i16;
    i32::from(high >> 4)
}

/// Narrows a Q31 multiplier to the 16-bit form the datapath consumes:
/// `(m + 2^15) >> 16`. A multiplier too close to 1.0 does not fit in a
/// signed halfword and wraps; that is preserved behavior, so the condition
/// is only reported.
pub fn narrow_multiplier(multiplier: i32) -> i32 {
    // The rounding add overflows for multipliers within 2^15 of 1.0 and
    // the narrowed value wraps negative.
    if multiplier > i32::MAX - (1 << 15) {
        warn!("output multiplier {multiplier:#x} did not narrow to 16 bits");
    }
    multiplier.wrapping_add(1 << 15) >> 16
}

/// Clamp to the fused-activation range.
pub fn clamp_activation(value: i32, min: i32, max: i32) -> i32 {
    value.clamp(min, max)
}
