/// Container file naming schemes. Older cards use `BLKDEVnn.PO`, newer ones
/// the shorter `VOLnn.PO`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Naming {
    Long,
    Short,
}

impl Naming {
    const EXTENSION: &'static [u8] = b".PO";

    fn base(self) -> &'static [u8] {
        match self {
            Naming::Long => b"BLKDEV",
            Naming::Short => b"VOL",
        }
    }

    /// The container file holding `volume`.
    pub fn file_name(self, volume: u8) -> ContainerName {
        let mut name = ContainerName {
            buf: [0u8; ContainerName::MAX_LEN],
            len: 0,
        };
        name.push(self.base());
        name.push(&[hex_digit(volume >> 4), hex_digit(volume & 0x0F)]);
        name.push(Self::EXTENSION);
        name
    }
}

/// Map 0..=15 to an uppercase hex character.
pub fn hex_digit(nibble: u8) -> u8 {
    if nibble < 10 {
        b'0' + nibble
    } else {
        b'A' + (nibble - 10)
    }
}

/// A formatted container file name.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ContainerName {
    buf: [u8; ContainerName::MAX_LEN],
    len: usize,
}

impl ContainerName {
    const MAX_LEN: usize = 11;

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    pub fn as_str(&self) -> &str {
        // only ever built from ASCII
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl core::fmt::Debug for ContainerName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl core::fmt::Display for ContainerName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
