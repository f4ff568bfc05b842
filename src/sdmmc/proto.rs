//! sdmmc-volumes - Constants and register layouts from the SD/MMC
//! Specifications
//!
//! Only the subset of commands needed for block transfer, bring-up and
//! identification is listed here.

//==============================================================================

// SD Card Commands. Application specific commands carry `ACMD_FLAG` and are
// sent as CMD55 followed by the command with the flag stripped.

/// Marks an application specific command
pub const ACMD_FLAG: u8 = 0x80;
/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0;
/// SEND_OP_COND - start MMC initialization
pub const CMD1: u8 = 1;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 8;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 9;
/// SEND_CID - read the Card Identification register
pub const CMD10: u8 = 10;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 12;
/// SET_BLOCKLEN - set the transfer block length
pub const CMD16: u8 = 16;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 17;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 18;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 24;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 25;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 55;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 58;
/// SD_STATUS - read the 64 byte SD status block
pub const ACMD13: u8 = ACMD_FLAG | 13;
/// SET_WR_BLK_ERASE_COUNT - pre-erase hint before a multi-block write
pub const ACMD23: u8 = ACMD_FLAG | 23;
/// SD_SEND_OP_COND - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = ACMD_FLAG | 41;

/// CMD8 argument: 2.7-3.6V supply range plus the 0xAA check pattern
pub const IF_COND_PATTERN: u32 = 0x1AA;
/// ACMD41 argument bit telling the card we support block addressing
pub const HCS_BIT: u32 = 1 << 30;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// set in an R1 response when the card did not answer at all
pub const R1_NO_RESPONSE: u8 = 0x80;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

//==============================================================================

bitflags::bitflags! {
    /// The kind of card found during initialization.
    pub struct CardType: u8 {
        /// MMC version 3
        const MMC = 0x01;
        /// SD version 1
        const SD1 = 0x02;
        /// SD version 2
        const SD2 = 0x04;
        /// Any SD card
        const SDC = Self::SD1.bits | Self::SD2.bits;
        /// Addressed in 512 byte blocks rather than bytes
        const BLOCK = 0x08;
    }
}

bitflags::bitflags! {
    /// The status of one card slot.
    pub struct DiskStatus: u8 {
        /// Not initialized (or initialization failed)
        const NOINIT = 0x01;
        /// No card in the socket
        const NODISK = 0x02;
        /// Write protected
        const PROTECT = 0x04;
    }
}

//==============================================================================

/// Card Specific Data. Versions 1 (SDv1 and MMC) and 2 (SDHC/SDXC) share
/// the first byte, which tells us how to decode the rest.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Default, Clone)]
pub struct Csd {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

impl Csd {
    /// Create a new, empty, CSD
    pub fn new() -> Csd {
        Csd::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(csd_structure, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size_v1, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(device_size_v2, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(erase_group_size, u8, 10, 2, 5);
    define_field!(erase_group_multiplier, u8, [(11, 0, 2), (11, 5, 3)]);
    define_field!(write_block_length, u8, [(12, 0, 2), (13, 6, 2)]);

    /// Is this a version 2 (block addressed capacity) CSD?
    pub fn is_v2(&self) -> bool {
        self.csd_structure() == 1
    }

    /// Number of 512 byte sectors on the card.
    pub fn sector_count(&self) -> u32 {
        if self.is_v2() {
            (self.device_size_v2() + 1) << 10
        } else {
            let shift = u32::from(self.read_block_length())
                + u32::from(self.device_size_multiplier())
                + 2;
            (self.device_size_v1() + 1) << shift.saturating_sub(9)
        }
    }

    /// Erase sector size of an SDv1 card, in 512 byte sectors.
    pub fn sd1_erase_block_size(&self) -> u32 {
        (u32::from(self.erase_sector_size()) + 1)
            << u32::from(self.write_block_length()).saturating_sub(9)
    }

    /// Erase group size of an MMCv3 card, in 512 byte sectors.
    pub fn mmc_erase_block_size(&self) -> u32 {
        (u32::from(self.erase_group_size()) + 1) * (u32::from(self.erase_group_multiplier()) + 1)
    }
}

impl core::fmt::Debug for Csd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Csd")
            .field("version", &(self.csd_structure() + 1))
            .field("sectors", &self.sector_count())
            .finish()
    }
}

/// Card Identification register.
#[derive(Debug, Default, Clone)]
pub struct Cid {
    /// The 16-bytes of data in this Card Identification block
    pub data: [u8; 16],
}

impl Cid {
    pub fn new() -> Cid {
        Cid::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(manufacturer_id, u8, 0, 0, 8);
    define_field!(oem_id, u16, [(1, 0, 8), (2, 0, 8)]);
    define_field!(product_revision, u8, 8, 0, 8);
    define_field!(serial_number, u32, [(9, 0, 8), (10, 0, 8), (11, 0, 8), (12, 0, 8)]);

    /// The five character product name, as raw ASCII.
    pub fn product_name(&self) -> &[u8] {
        &self.data[3..8]
    }
}

/// Operating Conditions Register, as returned by CMD58.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Ocr {
    pub data: [u8; 4],
}

impl Ocr {
    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(powered_up, bool, 0, 7);
    define_field!(card_capacity_status, bool, 0, 6);
}

/// The 64 byte SD status block returned by ACMD13.
#[derive(Clone)]
pub struct SdStatus {
    pub data: [u8; 64],
}

impl SdStatus {
    pub fn new() -> SdStatus {
        SdStatus { data: [0u8; 64] }
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(au_size, u8, 10, 4, 4);

    /// Allocation unit size, in 512 byte sectors.
    pub fn erase_block_size(&self) -> u32 {
        16u32 << self.au_size()
    }
}

impl Default for SdStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Perform the 7-bit CRC used on the SD card command packets.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}
