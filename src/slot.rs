//! sdmmc-volumes - Card slots and access requests

/// One of the two card reader circuits sharing the SPI bus.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot {
    Zero,
    One,
}

impl Slot {
    /// Both slots, in index order.
    pub const ALL: [Slot; 2] = [Slot::Zero, Slot::One];

    /// Map a host supplied slot index. Anything other than 0 or 1 is
    /// rejected.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Zero),
            1 => Some(Self::One),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }
}

/// A single block access as issued by the host: which slot, which emulated
/// disk (volume number) inside that slot and which 512 byte block of it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    /// Raw slot index; only 0 and 1 address a card.
    pub slot: u8,
    pub volume: u8,
    pub block: u16,
}

impl AccessRequest {
    pub fn new(slot: u8, volume: u8, block: u16) -> Self {
        AccessRequest {
            slot,
            volume,
            block,
        }
    }
}
