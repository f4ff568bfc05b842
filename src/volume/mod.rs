//! sdmmc-volumes - Storage request routing
//!
//! Turns a host `(slot, volume, block)` request into a transfer. A slot is
//! probed once: if a filesystem mounts, each volume number is a fixed size
//! container file on it; otherwise, if block 2 looks like a ProDOS volume
//! header, the card is a raw disk and each volume number owns a 32 MiB
//! region of it.
//!
//! Only one filesystem is mounted and one container file is open at any
//! time. Switching slot or volume closes the old handle first.

mod fs;
mod naming;
mod raw;


pub use fs::FileSystem;
pub use naming::{hex_digit, ContainerName, Naming};
pub use raw::{raw_sector, VolumeHeader, HEADER_BLOCK};

use crate::{AccessRequest, Block, BlockDevice, Slot};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// Status byte the host protocol uses for success.
pub const STATUS_OK: u8 = 0x00;

/// The ways a block request can fail, as far as the host is concerned.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Timeout, bad card response, short transfer, failed seek or a write
    /// past the end of a container.
    IoError,
    /// No card, nothing mountable, no such container file or a bad slot
    /// index.
    DeviceAbsent,
}

impl Error {
    /// The ProDOS error code for this failure.
    pub fn code(self) -> u8 {
        match self {
            Error::IoError => 0x27,
            Error::DeviceAbsent => 0x28,
        }
    }
}

/// The status byte to send back to the host for `result`.
pub fn status_code(result: &Result<(), Error>) -> u8 {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => e.code(),
    }
}

/// How the card in a slot is laid out.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VolumeFormat {
    /// Not probed yet.
    Unknown,
    /// Probed, nothing usable found.
    NoDisk,
    /// A mountable filesystem holding container files.
    ContainerFs,
    /// Disk images stored directly on the card.
    Raw,
}

struct OpenContainer<F> {
    volume: u8,
    file: F,
}

/// Routes block requests for both slots.
///
/// Holds everything that lives for a session: the format of each slot, the
/// mounted filesystem, the open container file and the naming scheme. Not
/// safe for concurrent use; requests must be issued one at a time.
pub struct StorageEngine<D, FS>
where
    D: BlockDevice,
    FS: FileSystem,
{
    devices: [D; 2],
    fs: FS,
    formats: [VolumeFormat; 2],
    mounted: Option<Slot>,
    open: Option<OpenContainer<FS::File>>,
    naming: Option<Naming>,
}

impl<D, FS> StorageEngine<D, FS>
where
    D: BlockDevice,
    FS: FileSystem,
{
    /// `devices[0]` and `devices[1]` are the cards in slot 0 and slot 1.
    pub fn new(devices: [D; 2], fs: FS) -> Self {
        StorageEngine {
            devices,
            fs,
            formats: [VolumeFormat::Unknown; 2],
            mounted: None,
            open: None,
            naming: None,
        }
    }

    /// The format of a slot, without probing it.
    pub fn format(&self, slot: Slot) -> VolumeFormat {
        self.formats[slot.index()]
    }

    /// The container naming scheme, once it has been decided.
    pub fn naming(&self) -> Option<Naming> {
        self.naming
    }

    pub fn mounted_slot(&self) -> Option<Slot> {
        self.mounted
    }

    /// The volume number of the open container file.
    pub fn open_volume(&self) -> Option<u8> {
        self.open.as_ref().map(|open| open.volume)
    }

    pub fn device(&mut self, slot: Slot) -> &mut D {
        &mut self.devices[slot.index()]
    }

    pub fn filesystem(&self) -> &FS {
        &self.fs
    }

    /// Is there something usable in this slot? Probes the slot on first
    /// use.
    pub fn check_slot_present(&mut self, slot: u8) -> Result<(), Error> {
        let slot = Slot::from_index(slot).ok_or(Error::DeviceAbsent)?;
        match self.resolve_format(slot) {
            VolumeFormat::ContainerFs | VolumeFormat::Raw => Ok(()),
            VolumeFormat::Unknown | VolumeFormat::NoDisk => Err(Error::DeviceAbsent),
        }
    }

    /// Read one block of a volume.
    pub fn read_block(&mut self, request: AccessRequest, block: &mut Block) -> Result<(), Error> {
        let slot = self.prepare(&request)?;
        if self.formats[slot.index()] == VolumeFormat::Raw {
            let sector = raw_sector(request.volume, request.block);
            return self.devices[slot.index()]
                .read(core::slice::from_mut(block), sector, "raw volume")
                .map_err(|_e| {
                    warn!("Read of sector {} failed", sector.0);
                    Error::IoError
                });
        }

        let open = self.open.as_mut().ok_or(Error::DeviceAbsent)?;
        let offset = u32::from(request.block) << 9;
        if self.fs.position(&open.file) != offset {
            self.fs.seek(&mut open.file, offset).map_err(|_e| {
                warn!("Seek to {} failed", offset);
                Error::IoError
            })?;
        }
        let read = self.fs.read(&mut open.file, &mut block.contents).map_err(|_e| {
            warn!("Read at {} failed", offset);
            Error::IoError
        })?;
        if read != Block::LEN {
            warn!("Short read at {}: {} bytes", offset, read);
            return Err(Error::IoError);
        }
        Ok(())
    }

    /// Write one block of a volume. Container files are never grown.
    pub fn write_block(&mut self, request: AccessRequest, block: &Block) -> Result<(), Error> {
        let slot = self.prepare(&request)?;
        if self.formats[slot.index()] == VolumeFormat::Raw {
            let sector = raw_sector(request.volume, request.block);
            return self.devices[slot.index()]
                .write(core::slice::from_ref(block), sector)
                .map_err(|_e| {
                    warn!("Write of sector {} failed", sector.0);
                    Error::IoError
                });
        }

        let open = self.open.as_mut().ok_or(Error::DeviceAbsent)?;
        let offset = u32::from(request.block) << 9;
        let size = self.fs.size(&open.file);
        if offset + Block::LEN_U32 > size {
            warn!("Write at {} is beyond the container size {}", offset, size);
            return Err(Error::IoError);
        }
        if self.fs.position(&open.file) != offset {
            self.fs.seek(&mut open.file, offset).map_err(|_e| {
                warn!("Seek to {} failed", offset);
                Error::IoError
            })?;
        }
        let written = self.fs.write(&mut open.file, &block.contents).map_err(|_e| {
            warn!("Write at {} failed", offset);
            Error::IoError
        })?;
        if written != Block::LEN {
            warn!("Short write at {}: {} bytes", offset, written);
            return Err(Error::IoError);
        }
        Ok(())
    }

    /// Close the open container and unmount the filesystem.
    pub fn shutdown(&mut self) {
        self.close_container();
        if let Some(slot) = self.mounted.take() {
            self.fs.unmount(slot);
        }
    }

    /// Forget everything learned about the cards, as after a controller
    /// reset. Slots are probed again on their next access.
    pub fn reset(&mut self) {
        debug!("Resetting storage engine");
        self.shutdown();
        self.formats = [VolumeFormat::Unknown; 2];
        self.naming = None;
    }

    /// Shut down and hand back the devices and the filesystem.
    pub fn release(mut self) -> ([D; 2], FS) {
        self.shutdown();
        (self.devices, self.fs)
    }

    /// Make the slot and volume of `request` ready for a transfer.
    fn prepare(&mut self, request: &AccessRequest) -> Result<Slot, Error> {
        let slot = Slot::from_index(request.slot).ok_or(Error::DeviceAbsent)?;
        match self.resolve_format(slot) {
            VolumeFormat::Raw => Ok(slot),
            VolumeFormat::ContainerFs => {
                self.mount(slot)?;
                self.open_container(slot, request.volume)?;
                Ok(slot)
            }
            VolumeFormat::Unknown | VolumeFormat::NoDisk => Err(Error::DeviceAbsent),
        }
    }

    fn resolve_format(&mut self, slot: Slot) -> VolumeFormat {
        let idx = slot.index();
        if self.formats[idx] == VolumeFormat::Unknown {
            let format = self.probe(slot);
            debug!("Slot {} format: {:?}", idx, format);
            self.formats[idx] = format;
        }
        self.formats[idx]
    }

    fn probe(&mut self, slot: Slot) -> VolumeFormat {
        let idx = slot.index();
        if self.devices[idx].initialize().is_err() {
            warn!("No usable card in slot {}", idx);
            return VolumeFormat::NoDisk;
        }

        if self.mount(slot).is_ok() {
            if self.naming.is_none() {
                self.negotiate_naming(slot);
            }
            return VolumeFormat::ContainerFs;
        }

        match self.devices[idx].read_block(HEADER_BLOCK, "volume header") {
            Ok(block) => {
                if VolumeHeader::new(block).is_valid() {
                    VolumeFormat::Raw
                } else {
                    VolumeFormat::NoDisk
                }
            }
            Err(_e) => {
                warn!("Can't read volume header of slot {}", idx);
                VolumeFormat::NoDisk
            }
        }
    }

    /// Look for volume 1 under the long naming scheme. If it is not there,
    /// use the short scheme from now on.
    fn negotiate_naming(&mut self, slot: Slot) {
        self.naming = Some(Naming::Long);
        if self.open_container(slot, 1).is_err() {
            self.naming = Some(Naming::Short);
        }
        debug!("Container naming: {:?}", self.naming);
    }

    fn mount(&mut self, slot: Slot) -> Result<(), Error> {
        if self.mounted == Some(slot) {
            return Ok(());
        }
        self.shutdown();
        match self.fs.mount(slot) {
            Ok(()) => {
                debug!("Mounted slot {}", slot.index());
                self.mounted = Some(slot);
                Ok(())
            }
            Err(_e) => {
                debug!("Can't mount slot {}", slot.index());
                Err(Error::DeviceAbsent)
            }
        }
    }

    fn open_container(&mut self, slot: Slot, volume: u8) -> Result<(), Error> {
        if self.open_volume() == Some(volume) {
            return Ok(());
        }
        self.close_container();
        let name = self.naming.unwrap_or(Naming::Long).file_name(volume);
        match self.fs.open(slot, name.as_str()) {
            Ok(file) => {
                debug!("Opened {}", name.as_str());
                self.open = Some(OpenContainer { volume, file });
                Ok(())
            }
            Err(_e) => {
                debug!("Can't open {}", name.as_str());
                Err(Error::DeviceAbsent)
            }
        }
    }

    fn close_container(&mut self) {
        if let Some(open) = self.open.take() {
            self.fs.close(open.file);
        }
    }
}
