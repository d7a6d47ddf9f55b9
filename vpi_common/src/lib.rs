//! Host side of the VPi power board I2C protocols.
//!
//! [`bootload`] pushes a firmware image through the board's bootloader,
//! [`device`] talks to the application firmware once it runs. Both sit on
//! the same bus; pass `&mut` handles to use them one after the other.
#![cfg_attr(not(test), no_std)]

pub mod bootload;
pub mod device;
pub mod error;
pub mod regs;

#[cfg(test)]
mod testing;

pub use bootload::{compute_checksum, Bootloader, FirmwareImage, Preamble, ResetPolarity};
pub use device::Vpi;
pub use error::{Error, Result};
pub use regs::{Clicks, Command, Config, Identity, Register, Status, Tone};
