//! sdmmc-volumes - Filesystem contract
//!
//! The router does not implement a filesystem. It needs exactly the
//! operations below, on one mounted volume and one open file at a time.

use crate::Slot;

/// A filesystem that can hold container files.
///
/// Implementations usually reach the card through their own
/// [`SlotDevice`](crate::sdmmc::SlotDevice).
pub trait FileSystem {
    /// An open file.
    type File;
    /// The errors the filesystem can return. Must be debug formattable.
    type Error: core::fmt::Debug;

    /// Mount the volume on the card in `slot`.
    fn mount(&mut self, slot: Slot) -> Result<(), Self::Error>;

    /// Unmount the volume on the card in `slot`.
    fn unmount(&mut self, slot: Slot);

    /// Open an existing file for reading and writing, on the mounted volume.
    fn open(&mut self, slot: Slot, name: &str) -> Result<Self::File, Self::Error>;

    /// Flush and close a file.
    fn close(&mut self, file: Self::File);

    /// Move the file position to `offset` bytes from the start.
    fn seek(&mut self, file: &mut Self::File, offset: u32) -> Result<(), Self::Error>;

    /// The current file position in bytes.
    fn position(&self, file: &Self::File) -> u32;

    /// Read up to `buf.len()` bytes at the file position.
    fn read(&mut self, file: &mut Self::File, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write up to `buf.len()` bytes at the file position.
    fn write(&mut self, file: &mut Self::File, buf: &[u8]) -> Result<usize, Self::Error>;

    /// The length of the file in bytes.
    fn size(&self, file: &Self::File) -> u32;
}
