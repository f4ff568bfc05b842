//! sdmmc-volumes - Block Device support
//!
//! Generic code for handling block devices.

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write blocks (or
/// sectors). Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Bring the device into a state where blocks can be transferred. Must be
    /// cheap to call again once the device is ready.
    fn initialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Read a single block.
    fn read_block(&mut self, block_idx: BlockIdx, reason: &str) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx, reason)?;
        let [block] = blocks;
        Ok(block)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        (*self).initialize()
    }

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

/// Errors from a [`MemoryBlockDevice`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The requested blocks run past the end of the backing memory.
    OutOfRange { block_count: BlockCount },
}

/// A block device backed by a byte slice, such as a disk image loaded into
/// RAM.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    fn range(&self, block_idx: usize, count: usize) -> Result<(usize, usize), MemoryError> {
        let start = block_idx * Block::LEN;
        let end = start + count * Block::LEN;
        if end > self.memory.len() {
            return Err(MemoryError::OutOfRange {
                block_count: BlockCount((self.memory.len() / Block::LEN) as u32),
            });
        }
        Ok((start, end))
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        let (start, end) = self.range(start_block_idx.0 as usize, blocks.len())?;
        for (block, chunk) in blocks
            .iter_mut()
            .zip(self.memory[start..end].chunks(Block::LEN))
        {
            block.contents.copy_from_slice(chunk);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let (start, end) = self.range(start_block_idx.0 as usize, blocks.len())?;
        for (block, chunk) in blocks
            .iter()
            .zip(self.memory[start..end].chunks_mut(Block::LEN))
        {
            chunk.copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.memory.len() / Block::LEN) as u32))
    }
}
