//! # sdmmc-volumes
//!
//! > SD/MMC cards as host disk volumes, written in Embedded Rust
//!
//! This crate turns one or two SD/MMC cards on a shared SPI bus into block
//! devices for a host that speaks a simple `(slot, volume, block)` protocol.
//! It is `#![no_std]` and does not use `alloc`.
//!
//! There are two layers:
//!
//! * [`sdmmc::SdMmcSpi`] brings cards up (MMCv3, SDv1, SDv2, byte or block
//!   addressed) and reads and writes 512 byte sectors.
//! * [`volume::StorageEngine`] decides per slot whether the card holds a
//!   filesystem with container files or raw disk images, and routes every
//!   request to the right sectors or file offsets.
//!
//! ## Using the crate
//!
//! You will need something that implements [`sdmmc::bus::SpiBus`] (or an
//! `embedded-hal` SPI peripheral plus chip select pins for
//! [`sdmmc::bus::HalSpiBus`]), a [`sdmmc::bus::Clock`], and a filesystem
//! that implements [`volume::FileSystem`].
//!
//! ```rust,ignore
//! let card = RefCell::new(SdMmcSpi::new(HalSpiBus::new(spi, cs0, cs1), clock));
//! let devices = [
//!     SlotDevice::new(&card, Slot::Zero),
//!     SlotDevice::new(&card, Slot::One),
//! ];
//! let mut engine = StorageEngine::new(devices, fat);
//! let mut block = Block::new();
//! let status = status_code(&engine.read_block(AccessRequest::new(0, 1, 2), &mut block));
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the `defmt-log` feature you can
//! configure this crate to log messages over defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
compile_error!("Must enable either log or defmt-log");


#[macro_use]
mod structure;

pub mod block_device;
pub mod sdmmc;
mod slot;
pub mod volume;

pub use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice, MemoryError,
};
pub use crate::sdmmc::Error as SdMmcError;
pub use crate::sdmmc::{SdMmcSpi, SlotDevice};
pub use crate::slot::{AccessRequest, Slot};
pub use crate::volume::Error as VolumeError;
pub use crate::volume::{status_code, StorageEngine, VolumeFormat};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
