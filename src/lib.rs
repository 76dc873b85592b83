//! Driver and kernel library for the eFPGA quantized-convolution block.
//!
//! The crate covers the full offload path for 1x1 pointwise convolutions:
//! a one-shot layout transform that rewrites eligible operators into the
//! accelerator's SIMD-grouped form, three interchangeable backends behind
//! the [`conv::ConvKernel`] seam (pure-software reference, software over
//! the grouped layout, and hardware offload), and the typed MMIO register
//! interface the hardware backend programs.
//!
//! With the `crosscheck` feature enabled (the default), every hardware
//! offload is recomputed in software and divergent bytes are logged.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod accel;
pub mod conv;
mod err;
pub mod registers;
mod shape;

pub use accel::{crosscheck_output, AccelKernel, ConvJob, Efpga};
pub use conv::{ConvArgs, ConvKernel, ConvParams};
pub use err::EfpgaError;
pub use shape::Shape4;
