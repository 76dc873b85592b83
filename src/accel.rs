//! Hardware-offload backend for the eFPGA convolution block, plus the
//! mismatch detector that cross-checks its output against the software
//! SIMD path.

use core::ptr::NonNull;

use spin::Mutex;
use tock_registers::interfaces::{Readable, Writeable};

#[cfg(feature = "crosscheck")]
use crate::conv::simd::conv_simd;
use crate::conv::{check_invocation, ConvArgs, ConvKernel, ConvParams, SIMD_LANES};
use crate::registers::{quant_word, EfpgaRegisters, CONTROL};
use crate::EfpgaError;

/// Geometry, base addresses and requantization constants for one offloaded
/// convolution, in register-ready form.
#[derive(Clone, Copy, Debug)]
pub struct ConvJob {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub filters: u32,
    pub pixel_base: u32,
    pub filter_base: u32,
    pub bias_base: u32,
    pub result_base: u32,
    pub quant: u32,
}

/// The eFPGA convolution device.
///
/// One job runs at a time; the job lock is held for the full duration of
/// an offload so a second caller cannot reprogram the block mid-flight.
pub struct Efpga {
    regs: EfpgaRegisters,
    job_lock: Mutex<()>,
}

impl Efpga {
    /// Creates a new eFPGA interface from a raw MMIO base address.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `base_addr` is the correctly mapped and
    /// aligned address of the eFPGA register file and that it remains
    /// valid for the lifetime of the returned structure.
    pub const unsafe fn new(base_addr: NonNull<u8>) -> Self {
        Self {
            regs: unsafe { EfpgaRegisters::new(base_addr) },
            job_lock: Mutex::new(()),
        }
    }

    /// Elapsed cycle count of the last completed job, for profiling.
    pub fn clocks(&self) -> u32 {
        self.regs.clocks.get()
    }

    /// Programs the register block, starts the job and waits for the busy
    /// bit to clear. Returns the elapsed cycle count.
    ///
    /// `spin_limit` bounds the busy-poll; `None` waits forever, which is
    /// the behavior hardware-in-the-loop runs want. A stalled accelerator
    /// with an unbounded wait hangs the caller indefinitely.
    pub fn run_conv(&self, job: &ConvJob, spin_limit: Option<u32>) -> Result<u32, EfpgaError> {
        let _guard = self.job_lock.lock();

        debug!(
            "offloading conv: {}x{} c={} f={} quant={:#010x}",
            job.width, job.height, job.channels, job.filters, job.quant
        );
        self.regs.width.set(job.width);
        self.regs.height.set(job.height);
        self.regs.channels.set(job.channels);
        self.regs.filters.set(job.filters);
        self.regs.total_pixels.set(job.width * job.height);
        self.regs.pixel_base.set(job.pixel_base);
        self.regs.filter_base.set(job.filter_base);
        self.regs.bias_base.set(job.bias_base);
        self.regs.result_base.set(job.result_base);
        self.regs.quant.set(job.quant);

        self.regs.control.write(CONTROL::START::SET);
        self.wait_done(spin_limit)?;

        let clocks = self.regs.clocks.get();
        debug!("conv complete, elapsed clocks = {clocks}");
        Ok(clocks)
    }

    /// Busy-wait until control bit 0 clears.
    fn wait_done(&self, spin_limit: Option<u32>) -> Result<(), EfpgaError> {
        let mut spins: u32 = 0;
        while self.regs.control.is_set(CONTROL::START) {
            if let Some(limit) = spin_limit {
                spins += 1;
                if spins > limit {
                    error!(
                        "accelerator stalled: control={:#x} after {} spins, \
                         geometry {}x{} c={} f={}",
                        self.regs.control.get(),
                        spins,
                        self.regs.width.get(),
                        self.regs.height.get(),
                        self.regs.channels.get(),
                        self.regs.filters.get(),
                    );
                    return Err(EfpgaError::Timeout);
                }
            }
            core::hint::spin_loop();
        }
        Ok(())
    }
}

/// Compares hardware-written output bytes against the software
/// expectation. Logs every divergence with its flat index and both values
/// and returns the mismatch count. The hardware result is never
/// overwritten; this is an observability signal, not a correctness gate.
pub fn crosscheck_output(hardware: &[u8], expected: &[u8]) -> usize {
    let mut mismatches = 0;
    for (i, (&actual, &expect)) in hardware.iter().zip(expected.iter()).enumerate() {
        if actual != expect {
            warn!("hardware mismatch at {i}: act={actual:#04x} exp={expect:#04x}");
            mismatches += 1;
        }
    }
    if mismatches != 0 {
        warn!("{mismatches} hardware/software divergences in {} bytes", hardware.len());
    }
    mismatches
}

/// Hardware-offload implementation of the backend contract.
///
/// Consumes the SIMD-grouped layout, exactly like [`SimdKernel`]
/// (`crate::conv::simd::SimdKernel`); the accelerator performs the same
/// accumulate-and-requantize over the same buffers. In instrumented builds
/// (`crosscheck` feature) every offload is recomputed in software and the
/// two outputs compared byte for byte.
pub struct AccelKernel<'a> {
    device: &'a Efpga,
    spin_limit: Option<u32>,
}

impl<'a> AccelKernel<'a> {
    pub fn new(device: &'a Efpga, spin_limit: Option<u32>) -> Self {
        Self { device, spin_limit }
    }
}

impl ConvKernel for AccelKernel<'_> {
    fn conv(
        &self,
        params: &ConvParams,
        args: &ConvArgs<'_>,
        output: &mut [u8],
    ) -> Result<(), EfpgaError> {
        check_invocation(params, args, output)?;
        let output_groups = args.filter_shape.dim(0);
        if output_groups * SIMD_LANES != args.output_shape.dim(3) {
            return Err(EfpgaError::ShapeMismatch);
        }

        let job = ConvJob {
            width: args.input_shape.dim(2) as u32,
            height: args.input_shape.dim(1) as u32,
            channels: args.input_shape.dim(3) as u32,
            filters: (output_groups * SIMD_LANES) as u32,
            pixel_base: args.input.as_ptr() as usize as u32,
            filter_base: args.filter.as_ptr() as usize as u32,
            bias_base: args
                .bias
                .map(|b| b.as_ptr() as usize as u32)
                .unwrap_or_default(),
            result_base: output.as_mut_ptr() as usize as u32,
            quant: quant_word(params.output_shift, params.output_multiplier),
        };
        self.device.run_conv(&job, self.spin_limit)?;

        #[cfg(feature = "crosscheck")]
        {
            let mut expected = alloc::vec![0u8; output.len()];
            conv_simd(params, args, &mut expected)?;
            crosscheck_output(output, &expected);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::CONTROL_BUSY;
    use crate::Shape4;
    use alloc::vec;
    use core::ptr::NonNull;

    /// Plain memory standing in for the MMIO block: the busy bit written
    /// by `run_conv` reads back set forever, so only the bounded wait can
    /// return.
    #[repr(C, align(4))]
    struct MockRegs([u32; 12]);

    fn job() -> ConvJob {
        ConvJob {
            width: 24,
            height: 18,
            channels: 4,
            filters: 8,
            pixel_base: 0x1000,
            filter_base: 0x2000,
            bias_base: 0x3000,
            result_base: 0x4000,
            quant: quant_word(-7, 0x1234),
        }
    }

    #[test]
    fn stalled_accelerator_times_out() {
        let mut mock = MockRegs([0; 12]);
        let base = NonNull::new(mock.0.as_mut_ptr() as *mut u8).unwrap();
        let dev = unsafe { Efpga::new(base) };
        assert_eq!(dev.run_conv(&job(), Some(64)), Err(EfpgaError::Timeout));
        // Geometry and addresses were programmed before the start bit.
        assert_eq!(mock.0[0], 24);
        assert_eq!(mock.0[1], 18);
        assert_eq!(mock.0[2], 4);
        assert_eq!(mock.0[3], 8);
        assert_eq!(mock.0[4], 24 * 18);
        assert_eq!(mock.0[5], 0x1000);
        assert_eq!(mock.0[6], 0x2000);
        assert_eq!(mock.0[7], 0x3000);
        assert_eq!(mock.0[8], 0x4000);
        assert_eq!(mock.0[9], 0x0007_1234);
        assert_eq!(mock.0[10] & CONTROL_BUSY, 1);
    }

    #[test]
    fn completed_job_reports_clocks() {
        let mut mock = MockRegs([0; 12]);
        mock.0[11] = 12345;
        let base = NonNull::new(mock.0.as_mut_ptr() as *mut u8).unwrap();
        let dev = unsafe { Efpga::new(base) };
        // Busy bit already clear: wait_done returns immediately.
        assert_eq!(dev.wait_done(Some(1)), Ok(()));
        assert_eq!(dev.clocks(), 12345);
    }

    #[test]
    fn crosscheck_reports_but_does_not_repair() {
        let expected = vec![7u8, 8, 9, 10];
        let mut hardware = expected.clone();
        hardware[2] = 0xEE;
        let snapshot = hardware.clone();
        assert_eq!(crosscheck_output(&hardware, &expected), 1);
        assert_eq!(hardware, snapshot);
        assert_eq!(crosscheck_output(&expected, &expected), 0);
    }

    #[test]
    fn accel_kernel_rejects_ungrouped_shapes() {
        let mut mock = MockRegs([0; 12]);
        let base = NonNull::new(mock.0.as_mut_ptr() as *mut u8).unwrap();
        let dev = unsafe { Efpga::new(base) };
        let kernel = AccelKernel::new(&dev, Some(8));
        let params = ConvParams::default();
        let args = ConvArgs {
            input_shape: Shape4::new(1, 1, 1, 2),
            input: &[128, 128],
            filter_shape: Shape4::new(3, 1, 1, 2), // 3 groups != 8 channels
            filter: &[0; 48],
            bias: None,
            output_shape: Shape4::new(1, 1, 1, 8),
        };
        let mut out = vec![0u8; 8];
        assert_eq!(
            kernel.conv(&params, &args, &mut out),
            Err(EfpgaError::ShapeMismatch)
        );
    }
}
