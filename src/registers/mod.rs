//! Memory-mapped register definitions for the eFPGA convolution block.
//!
//! The register layout is described using [`tock_registers`], which provides
//! a safe and zero-cost abstraction over volatile MMIO access. The driver
//! code programs these fields instead of scattering raw offsets and casts
//! around the offload path.
//!
//! Programming contract: the caller populates the geometry and base-address
//! fields plus `quant`, writes `control = 1` to start, then polls `control`
//! until bit 0 clears. `clocks` then holds the elapsed cycle count of the
//! completed job.

use core::{ops::Deref, ptr::NonNull};

use tock_registers::{register_structs, registers::ReadWrite};

register_structs! {
    pub EfpgaRegs {
        /// Input image width in pixels.
        (0x0000 => pub width: ReadWrite<u32>),
        /// Input image height in pixels.
        (0x0004 => pub height: ReadWrite<u32>),
        /// Input channel count.
        (0x0008 => pub channels: ReadWrite<u32>),
        /// Total output filter count (SIMD groups x 8).
        (0x000C => pub filters: ReadWrite<u32>),
        /// width * height, precomputed for the datapath.
        (0x0010 => pub total_pixels: ReadWrite<u32>),
        /// Bus address of the input activation buffer.
        (0x0014 => pub pixel_base: ReadWrite<u32>),
        /// Bus address of the grouped signed filter buffer.
        (0x0018 => pub filter_base: ReadWrite<u32>),
        /// Bus address of the folded bias buffer.
        (0x001C => pub bias_base: ReadWrite<u32>),
        /// Bus address of the output buffer the accelerator writes.
        (0x0020 => pub result_base: ReadWrite<u32>),
        /// Packed requantization constants, see [`quant_word`].
        (0x0024 => pub quant: ReadWrite<u32>),
        /// Bit 0: start (write) / busy (read).
        (0x0028 => pub control: ReadWrite<u32, CONTROL::Register>),
        /// Elapsed cycles of the last completed job.
        (0x002C => pub clocks: ReadWrite<u32>),
        (0x0030 => @END),
    }
}

tock_registers::register_bitfields! {u32,
    pub CONTROL [
        /// Set to start a job; reads back 1 while the job is in flight.
        START OFFSET(0) NUMBITS(1) []
    ]
}

/// Mask for the busy bit in `control`.
pub const CONTROL_BUSY: u32 = 1;

/// Packs the requantization constants the way the datapath consumes them:
/// the positive right-shift count in the high halfword, the narrowed 16-bit
/// multiplier in the low halfword.
pub const fn quant_word(output_shift: i32, multiplier: i32) -> u32 {
    (((-output_shift) as u32) << 16) | (multiplier as u16 as u32)
}

/// Typed view of the eFPGA register file.
///
/// Created from an MMIO base address; dereferences to the raw register
/// block so callers use the field accessors directly.
pub struct EfpgaRegisters {
    base: NonNull<EfpgaRegs>,
}

unsafe impl Send for EfpgaRegisters {}

impl EfpgaRegisters {
    /// Create a new facade over the eFPGA MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `base_addr` is the correctly mapped and
    /// aligned address of the eFPGA register file and that it remains valid
    /// for the lifetime of the returned structure.
    pub const unsafe fn new(base_addr: NonNull<u8>) -> Self {
        Self {
            base: base_addr.cast(),
        }
    }
}

impl Deref for EfpgaRegisters {
    type Target = EfpgaRegs;

    fn deref(&self) -> &Self::Target {
        unsafe { self.base.as_ref() }
    }
}
