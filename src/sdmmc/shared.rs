use core::cell::RefCell;

use crate::sdmmc::bus::{Clock, SpiBus};
use crate::{Block, BlockCount, BlockDevice, BlockIdx, Slot};

use super::{Error, SdMmcSpi};

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// One slot of a driver that is shared through a `RefCell`.
///
/// The volume router and a filesystem implementation both need the card.
/// On a single threaded system each can hold its own `SlotDevice`; the
/// driver is only borrowed for the duration of one call.
pub struct SlotDevice<'a, BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    card: &'a RefCell<SdMmcSpi<BUS, CLK>>,
    slot: Slot,
}

impl<'a, BUS, CLK> SlotDevice<'a, BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    pub fn new(card: &'a RefCell<SdMmcSpi<BUS, CLK>>, slot: Slot) -> Self {
        SlotDevice { card, slot }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }
}

impl<'a, BUS, CLK> BlockDevice for SlotDevice<'a, BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    type Error = Error;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        self.card.borrow_mut().initialize(self.slot).map(|_| ())
    }

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        trace!(
            "Read {} blocks @ {} of slot {} for {}",
            blocks.len(),
            start_block_idx.0,
            self.slot.index(),
            reason
        );
        self.card.borrow_mut().read(self.slot, blocks, start_block_idx)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        trace!(
            "Write {} blocks @ {} of slot {}",
            blocks.len(),
            start_block_idx.0,
            self.slot.index()
        );
        self.card.borrow_mut().write(self.slot, blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        self.card.borrow_mut().sector_count(self.slot)
    }
}
