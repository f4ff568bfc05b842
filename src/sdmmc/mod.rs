//! sdmmc-volumes - SDMMC Protocol
//!
//! Implements the SD/MMC protocol on an SPI bus shared by up to two card
//! slots. Supports MMCv3, SDv1 and SDv2 cards, both byte and block
//! addressed.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod bus;
pub mod proto;
mod select;
mod shared;

#[cfg(test)]
pub(crate) mod test;

use bus::{Clock, ClockSpeed, SpiBus};
use proto::*;
use select::Selected;
pub use shared::SlotDevice;

use crate::{Block, BlockCount, BlockIdx, Slot};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

/// The possible errors `SdMmcSpi` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the SPI peripheral or a chip select pin
    Transport,
    /// The slot has not been (successfully) initialized
    NotReady,
    /// A zero length transfer was requested
    ParameterError,
    /// The card is write protected
    WriteProtected,
    /// Couldn't find the card
    CardNotFound,
    /// The card never confirmed the idle state after reset
    NoIdleResponse,
    /// The card accepted CMD8 but rejected our voltage range or pattern
    UnsupportedCard,
    /// Type negotiation did not finish in time
    TimeoutInitialization,
    /// We didn't get a response when reading data from the card
    TimeoutReadBuffer,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// The card rejected (or did not answer) this command
    CommandFailed(u8),
    /// Error reading from the card
    ReadError,
    /// Error writing to the card
    WriteError,
}

/// How much of the detail in an [`Error`] a block layer cares about.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotReady,
    Parameter,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotReady
            | Error::CardNotFound
            | Error::NoIdleResponse
            | Error::UnsupportedCard
            | Error::TimeoutInitialization => ErrorKind::NotReady,
            Error::ParameterError => ErrorKind::Parameter,
            _ => ErrorKind::Io,
        }
    }
}

/// Timing and retry options for talking to a card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub struct CardOptions {
    /// How often CMD0 is sent before giving up on a card.
    pub reset_attempts: u8,
    /// Pause between two CMD0 attempts.
    pub reset_pause_ms: u32,
    /// Budget for the whole type negotiation after reset.
    pub init_timeout_ms: u32,
    /// How long to wait for the start token of each data block.
    pub read_token_timeout_ms: u32,
    /// How long to wait for the card to be ready before a command or data
    /// block.
    pub ready_timeout_ms: u32,
}

impl Default for CardOptions {
    fn default() -> Self {
        CardOptions {
            reset_attempts: 5,
            reset_pause_ms: 1,
            init_timeout_ms: 1000,
            read_token_timeout_ms: 200,
            ready_timeout_ms: 500,
        }
    }
}

/// A deadline measured on a wrapping millisecond counter.
pub(crate) struct Timeout<'c, CLK>
where
    CLK: Clock,
{
    clock: &'c CLK,
    start: u32,
    limit_ms: u32,
}

impl<'c, CLK> Timeout<'c, CLK>
where
    CLK: Clock,
{
    pub fn start(clock: &'c CLK, limit_ms: u32) -> Self {
        Timeout {
            clock,
            start: clock.now_ms(),
            limit_ms,
        }
    }

    pub fn expired(&self) -> bool {
        self.clock.now_ms().wrapping_sub(self.start) >= self.limit_ms
    }
}

/// What we know about the card in one slot.
#[derive(Debug, Copy, Clone)]
struct CardSlot {
    status: DiskStatus,
    card_type: CardType,
    /// The last write left the card programming, with DO held low.
    busy: bool,
}

impl CardSlot {
    const fn new() -> Self {
        CardSlot {
            status: DiskStatus::NOINIT,
            card_type: CardType::empty(),
            busy: false,
        }
    }
}

/// The SD/MMC driver for both card slots on one SPI bus.
pub struct SdMmcSpi<BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    bus: BUS,
    clock: CLK,
    options: CardOptions,
    slots: [CardSlot; 2],
}

impl<BUS, CLK> SdMmcSpi<BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    /// Create a new SD/MMC driver. Both slots start uninitialized.
    pub fn new(bus: BUS, clock: CLK) -> Self {
        Self::new_with_options(bus, clock, CardOptions::default())
    }

    pub fn new_with_options(bus: BUS, clock: CLK, options: CardOptions) -> Self {
        SdMmcSpi {
            bus,
            clock,
            options,
            slots: [CardSlot::new(), CardSlot::new()],
        }
    }

    /// Get a temporary borrow on the underlying bus. Call
    /// [`SdMmcSpi::wait_bus_busy`] first if another device is about to use
    /// it.
    pub fn bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut BUS) -> T,
    {
        func(&mut self.bus)
    }

    pub fn release(self) -> (BUS, CLK) {
        (self.bus, self.clock)
    }

    /// Run `f` with exclusive use of the bus for `slot`.
    ///
    /// The slot is always deselected afterwards, even if an error occured in
    /// `f`.
    fn with_chip_select<F, R>(&mut self, slot: Slot, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Selected<BUS, CLK>) -> Result<R, Error>,
    {
        let mut selected = Selected::new(
            &mut self.bus,
            &self.clock,
            slot,
            &mut self.slots[slot.index()].busy,
            self.options,
        );
        f(&mut selected)
    }

    fn check_ready(&mut self, slot: Slot) -> Result<CardType, Error> {
        let state = &self.slots[slot.index()];
        if state.status.contains(DiskStatus::NOINIT) {
            return Err(Error::NotReady);
        }
        // Something else may have reprogrammed the bus since our last
        // transfer.
        self.bus
            .set_clock(ClockSpeed::Fast)
            .map_err(|_e| Error::Transport)?;
        Ok(state.card_type)
    }

    /// Current status flags of a slot.
    pub fn status(&self, slot: Slot) -> DiskStatus {
        self.slots[slot.index()].status
    }

    /// The type of card found by the last successful initialization.
    pub fn card_type(&self, slot: Slot) -> Result<CardType, Error> {
        let state = &self.slots[slot.index()];
        if state.status.contains(DiskStatus::NOINIT) {
            return Err(Error::NotReady);
        }
        Ok(state.card_type)
    }

    /// Is the card in `slot` possibly still programming after a write?
    pub fn is_busy(&self, slot: Slot) -> bool {
        self.slots[slot.index()].busy
    }

    /// Bring the card in `slot` into a state where blocks can be
    /// transferred. Does nothing if the slot is already initialized.
    pub fn initialize(&mut self, slot: Slot) -> Result<DiskStatus, Error> {
        let idx = slot.index();
        if !self.slots[idx].status.contains(DiskStatus::NOINIT) {
            return Ok(self.slots[idx].status);
        }

        if self.bus.card_detected(slot) {
            self.slots[idx].status.remove(DiskStatus::NODISK);
        } else {
            debug!("No card in slot {}", idx);
            self.slots[idx].status.insert(DiskStatus::NODISK);
            return Err(Error::CardNotFound);
        }

        debug!("Initializing card in slot {}", idx);
        let result = self.bring_up(slot);

        match result {
            Ok(card_type) => {
                debug!("Card in slot {} is type {:x}", idx, card_type.bits());
                let write_protected = self.bus.write_protected(slot);
                let state = &mut self.slots[idx];
                state.card_type = card_type;
                state.status.remove(DiskStatus::NOINIT);
                state.status.set(DiskStatus::PROTECT, write_protected);
                self.bus
                    .set_clock(ClockSpeed::Fast)
                    .map_err(|_e| Error::Transport)?;
                Ok(self.slots[idx].status)
            }
            Err(e) => {
                warn!("Card in slot {} failed to initialize: {:?}", idx, e);
                let state = &mut self.slots[idx];
                state.card_type = CardType::empty();
                state.status.insert(DiskStatus::NOINIT);
                self.bus.power_off().ok();
                Err(e)
            }
        }
    }

    /// Reset the card and negotiate its type, all at the slow clock rate.
    fn bring_up(&mut self, slot: Slot) -> Result<CardType, Error> {
        self.bus.power_on().map_err(|_e| Error::Transport)?;
        self.bus
            .set_clock(ClockSpeed::Slow)
            .map_err(|_e| Error::Transport)?;
        self.bus.deselect().map_err(|_e| Error::Transport)?;
        // Supply minimum of 74 clock cycles without CS asserted.
        for _ in 0..10 {
            self.bus.exchange(0xFF).map_err(|_e| Error::Transport)?;
        }

        let options = self.options;
        let clock = &self.clock;
        let mut s = Selected::new(
            &mut self.bus,
            clock,
            slot,
            &mut self.slots[slot.index()].busy,
            options,
        );

        // Enter SPI mode
        let mut attempt = 0;
        loop {
            attempt += 1;
            trace!("Reset card, attempt {}..", attempt);
            let r1 = s.card_command(CMD0, 0)?;
            if r1 == R1_IDLE_STATE {
                break;
            }
            if attempt >= options.reset_attempts {
                return Err(Error::NoIdleResponse);
            }
            warn!("Got response: {:x}, trying again..", r1);
            clock.delay_ms(options.reset_pause_ms);
        }

        let timeout = Timeout::start(clock, options.init_timeout_ms);
        if s.card_command(CMD8, IF_COND_PATTERN)? == R1_IDLE_STATE {
            // Trailing four bytes of the R7 response
            let mut r7 = [0u8; 4];
            s.receive_into(&mut r7)?;
            if r7[2] != 0x01 || r7[3] != 0xAA {
                return Err(Error::UnsupportedCard);
            }
            trace!("SDv2 card, waiting for it to leave idle state");
            while s.card_command(ACMD41, HCS_BIT)? != R1_READY_STATE {
                if timeout.expired() {
                    return Err(Error::TimeoutInitialization);
                }
            }
            if s.card_command(CMD58, 0)? != R1_READY_STATE {
                return Err(Error::CommandFailed(CMD58));
            }
            let mut ocr = Ocr::default();
            s.receive_into(&mut ocr.data)?;
            if ocr.card_capacity_status() {
                Ok(CardType::SD2 | CardType::BLOCK)
            } else {
                Ok(CardType::SD2)
            }
        } else {
            let (card_type, command) = if s.card_command(ACMD41, 0)? <= R1_IDLE_STATE {
                (CardType::SD1, ACMD41)
            } else {
                (CardType::MMC, CMD1)
            };
            trace!("Card type {:x}, waiting for it to leave idle state", card_type.bits());
            while s.card_command(command, 0)? != R1_READY_STATE {
                if timeout.expired() {
                    return Err(Error::TimeoutInitialization);
                }
            }
            if s.card_command(CMD16, Block::LEN_U32)? != R1_READY_STATE {
                return Err(Error::CommandFailed(CMD16));
            }
            Ok(card_type)
        }
    }

    /// Forget the card in `slot`. The next [`SdMmcSpi::initialize`] performs
    /// the full bring-up again.
    pub fn power_off(&mut self, slot: Slot) -> Result<(), Error> {
        self.slots[slot.index()].status.insert(DiskStatus::NOINIT);
        self.bus.power_off().map_err(|_e| Error::Transport)
    }

    /// Byte addressed cards can't reach blocks at or beyond 8M (4 GiB).
    fn start_address(card_type: CardType, start_block_idx: BlockIdx) -> Result<u32, Error> {
        if card_type.contains(CardType::BLOCK) {
            Ok(start_block_idx.0)
        } else {
            start_block_idx
                .0
                .checked_mul(Block::LEN_U32)
                .ok_or(Error::ParameterError)
        }
    }

    /// Read one or more blocks, starting at the given block index.
    pub fn read(
        &mut self,
        slot: Slot,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Error> {
        if blocks.is_empty() {
            return Err(Error::ParameterError);
        }
        let card_type = self.check_ready(slot)?;
        let start_idx = Self::start_address(card_type, start_block_idx)?;
        self.with_chip_select(slot, |s| {
            if blocks.len() == 1 {
                // Start a single-block read
                if s.card_command(CMD17, start_idx)? != R1_READY_STATE {
                    return Err(Error::CommandFailed(CMD17));
                }
                s.read_data(&mut blocks[0].contents)
            } else {
                // Start a multi-block read
                if s.card_command(CMD18, start_idx)? != R1_READY_STATE {
                    return Err(Error::CommandFailed(CMD18));
                }
                let mut result = Ok(());
                for block in blocks.iter_mut() {
                    result = s.read_data(&mut block.contents);
                    if result.is_err() {
                        break;
                    }
                }
                // Stop the read
                s.card_command(CMD12, 0)?;
                result
            }
        })
    }

    /// Write one or more blocks, starting at the given block index.
    pub fn write(&mut self, slot: Slot, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        if blocks.is_empty() {
            return Err(Error::ParameterError);
        }
        let card_type = self.check_ready(slot)?;
        if self.slots[slot.index()].status.contains(DiskStatus::PROTECT) {
            return Err(Error::WriteProtected);
        }
        let start_idx = Self::start_address(card_type, start_block_idx)?;
        self.with_chip_select(slot, |s| {
            if blocks.len() == 1 {
                // Start a single-block write
                if s.card_command(CMD24, start_idx)? != R1_READY_STATE {
                    return Err(Error::CommandFailed(CMD24));
                }
                s.write_data(DATA_START_BLOCK, &blocks[0].contents)
            } else {
                if card_type.intersects(CardType::SDC) {
                    s.card_command(ACMD23, blocks.len() as u32)?;
                }
                // Start a multi-block write
                if s.card_command(CMD25, start_idx)? != R1_READY_STATE {
                    return Err(Error::CommandFailed(CMD25));
                }
                let mut result = Ok(());
                for block in blocks.iter() {
                    result = s.write_data(WRITE_MULTIPLE_TOKEN, &block.contents);
                    if result.is_err() {
                        break;
                    }
                }
                // Stop the write, also after a failed block
                let stop = s.write_stop();
                result.and(stop)
            }
        })
    }

    /// Let a card that is still programming release the data line.
    ///
    /// The card keeps DO low until it has finished a write and seen another
    /// clock. Call this before talking to any other device on the same bus.
    /// Nothing happens unless the last write left the card busy.
    pub fn wait_bus_busy(&mut self, slot: Slot) -> Result<(), Error> {
        if !self.slots[slot.index()].busy {
            return Ok(());
        }
        trace!("Waiting for slot {} to finish programming", slot.index());
        self.with_chip_select(slot, |s| s.select().map(|_| ()))
    }

    /// Make sure no write is still being programmed.
    pub fn sync(&mut self, slot: Slot) -> Result<(), Error> {
        self.check_ready(slot)?;
        self.with_chip_select(slot, |s| {
            if s.select()? {
                Ok(())
            } else {
                Err(Error::TimeoutWaitNotBusy)
            }
        })
    }

    /// Read the 'card specific data' block.
    pub fn read_csd(&mut self, slot: Slot) -> Result<Csd, Error> {
        self.check_ready(slot)?;
        self.with_chip_select(slot, |s| {
            let mut csd = Csd::new();
            if s.card_command(CMD9, 0)? != R1_READY_STATE {
                return Err(Error::CommandFailed(CMD9));
            }
            s.read_data(&mut csd.data)?;
            Ok(csd)
        })
    }

    /// Read the 'card identification' block.
    pub fn read_cid(&mut self, slot: Slot) -> Result<Cid, Error> {
        self.check_ready(slot)?;
        self.with_chip_select(slot, |s| {
            let mut cid = Cid::new();
            if s.card_command(CMD10, 0)? != R1_READY_STATE {
                return Err(Error::CommandFailed(CMD10));
            }
            s.read_data(&mut cid.data)?;
            Ok(cid)
        })
    }

    /// Read the operating conditions register.
    pub fn read_ocr(&mut self, slot: Slot) -> Result<Ocr, Error> {
        self.check_ready(slot)?;
        self.with_chip_select(slot, |s| {
            let mut ocr = Ocr::default();
            if s.card_command(CMD58, 0)? != R1_READY_STATE {
                return Err(Error::CommandFailed(CMD58));
            }
            s.receive_into(&mut ocr.data)?;
            Ok(ocr)
        })
    }

    /// Read the 64 byte SD status block. SD cards only.
    pub fn sd_status(&mut self, slot: Slot) -> Result<SdStatus, Error> {
        self.check_ready(slot)?;
        self.with_chip_select(slot, |s| {
            let mut status = SdStatus::new();
            if s.card_command(ACMD13, 0)? != R1_READY_STATE {
                return Err(Error::CommandFailed(ACMD13));
            }
            // second byte of the R2 response
            s.receive()?;
            s.read_data(&mut status.data)?;
            Ok(status)
        })
    }

    /// Determine how many blocks the card in `slot` can hold.
    pub fn sector_count(&mut self, slot: Slot) -> Result<BlockCount, Error> {
        let csd = self.read_csd(slot)?;
        debug!("CSD: {:?}", csd);
        Ok(BlockCount(csd.sector_count()))
    }

    /// Erase block size, in 512 byte sectors.
    pub fn erase_block_size(&mut self, slot: Slot) -> Result<u32, Error> {
        let card_type = self.card_type(slot)?;
        if card_type.contains(CardType::SD2) {
            Ok(self.sd_status(slot)?.erase_block_size())
        } else if card_type.contains(CardType::SD1) {
            Ok(self.read_csd(slot)?.sd1_erase_block_size())
        } else {
            Ok(self.read_csd(slot)?.mmc_erase_block_size())
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
