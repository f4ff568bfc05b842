use crate::{Block, BlockIdx};

/// Where a raw card keeps the volume directory header of volume 0.
pub const HEADER_BLOCK: BlockIdx = BlockIdx(2);

/// The key block of a ProDOS volume directory, as found on a card that holds
/// disk images without a filesystem.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    block: Block,
}

impl VolumeHeader {
    /// Entry length $27, entries per block $0D.
    pub const ENTRY_FORMAT: u16 = 0x0D27;
    /// Storage type nibble $F (volume header) with an empty name.
    pub const HEADER_STORAGE_TYPE: u8 = 0xF0;

    pub fn new(block: Block) -> Self {
        VolumeHeader { block }
    }

    fn data(&self) -> &[u8] {
        &self.block.contents
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block.contents
    }

    define_field!(storage_type, set_storage_type, u8, 0x04);
    define_field!(entry_format, set_entry_format, u16, 0x23);

    /// Does this look like a raw disk? A volume header with a name, or the
    /// directory entry format, is enough; only a block failing both is
    /// rejected.
    pub fn is_valid(&self) -> bool {
        self.storage_type() > Self::HEADER_STORAGE_TYPE || self.entry_format() == Self::ENTRY_FORMAT
    }

    pub fn into_block(self) -> Block {
        self.block
    }
}

/// The physical sector of a raw disk holding `block` of `volume`. Every
/// volume number owns a 64K block (32 MiB) region of the card.
pub fn raw_sector(volume: u8, block: u16) -> BlockIdx {
    BlockIdx((u32::from(volume) << 16) | u32::from(block))
}
