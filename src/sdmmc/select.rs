use crate::sdmmc::bus::{Clock, SpiBus};
use crate::sdmmc::proto::*;
use crate::Slot;

use super::{CardOptions, Error, Timeout};

/// A struct used to ensure that communication only occurs while one slot
/// owns the bus, and that the bus is always released afterwards.
///
/// This struct is responsible for command framing, data tokens and the
/// bookkeeping of the card's programming-busy state.
pub(crate) struct Selected<'a, BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    bus: &'a mut BUS,
    clock: &'a CLK,
    slot: Slot,
    busy: &'a mut bool,
    options: CardOptions,
}

impl<'a, BUS, CLK> Drop for Selected<'a, BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    fn drop(&mut self) {
        self.deselect().ok();
    }
}

impl<'a, BUS, CLK> Selected<'a, BUS, CLK>
where
    BUS: SpiBus,
    CLK: Clock,
{
    pub fn new(
        bus: &'a mut BUS,
        clock: &'a CLK,
        slot: Slot,
        busy: &'a mut bool,
        options: CardOptions,
    ) -> Self {
        Self {
            bus,
            clock,
            slot,
            busy,
            options,
        }
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.bus.exchange(out).map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the SD card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Clock in the trailing bytes of an R3/R7 response.
    pub fn receive_into(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        for b in buf.iter_mut() {
            *b = self.receive()?;
        }
        Ok(())
    }

    /// Spin until the card releases DO (returns 0xFF), or until `timeout_ms`
    /// have elapsed. Records whether the card was still busy.
    pub fn wait_ready(&mut self, timeout_ms: u32) -> Result<bool, Error> {
        let timeout = Timeout::start(self.clock, timeout_ms);
        let mut d = self.receive()?;
        while d != 0xFF && !timeout.expired() {
            d = self.receive()?;
        }
        *self.busy = d != 0xFF;
        Ok(d == 0xFF)
    }

    /// Raise chip select and give the card one more clock so it lets go of
    /// DO.
    pub fn deselect(&mut self) -> Result<(), Error> {
        self.bus.deselect().map_err(|_e| Error::Transport)?;
        self.receive()?;
        Ok(())
    }

    /// Lower chip select and wait for the card to be ready. On timeout the
    /// card is deselected again and `false` returned.
    pub fn select(&mut self) -> Result<bool, Error> {
        self.bus.select(self.slot).map_err(|_e| Error::Transport)?;
        self.receive()?;
        if self.wait_ready(self.options.ready_timeout_ms)? {
            return Ok(true);
        }
        self.deselect()?;
        Ok(false)
    }

    /// Perform a command and return its R1 response. Bit 7 of the response
    /// is set when the card never answered or was not ready to take the
    /// command.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        let mut command = command;
        if (command & ACMD_FLAG) != 0 {
            command &= !ACMD_FLAG;
            let result = self.card_command(CMD55, 0)?;
            if result > R1_IDLE_STATE {
                return Ok(result);
            }
        }

        // a stop command has to go out while the read is still streaming
        if command != CMD12 {
            self.deselect()?;
            if !self.select()? {
                return Ok(0xFF);
            }
        }

        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[0..5]);

        for b in buf.iter() {
            self.send(*b)?;
        }

        // skip stuff byte for stop read
        if command == CMD12 {
            let _result = self.receive()?;
        }

        let mut result = self.receive()?;
        for _ in 1..10 {
            if (result & R1_NO_RESPONSE) == 0 {
                break;
            }
            result = self.receive()?;
        }
        Ok(result)
    }

    /// Read a data packet from the card. Always fills the given buffer, so
    /// make sure it's the right size. The CRC is clocked in but not checked.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let timeout = Timeout::start(self.clock, self.options.read_token_timeout_ms);
        let mut token = self.receive()?;
        while token == 0xFF && !timeout.expired() {
            token = self.receive()?;
        }
        if token == 0xFF {
            return Err(Error::TimeoutReadBuffer);
        }
        if token != DATA_START_BLOCK {
            return Err(Error::ReadError);
        }

        self.bus
            .receive_block(buffer)
            .map_err(|_e| Error::Transport)?;

        self.receive()?;
        self.receive()?;
        Ok(())
    }

    /// Send one data packet to the card, preceded by `token`.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        if !self.wait_ready(self.options.ready_timeout_ms)? {
            return Err(Error::TimeoutWaitNotBusy);
        }
        self.send(token)?;
        self.bus.send_block(buffer).map_err(|_e| Error::Transport)?;
        // dummy CRC
        self.send(0xFF)?;
        self.send(0xFF)?;
        let status = self.receive()?;
        // Sample once more so a following user of the bus knows whether the
        // card is still holding DO low while it programs.
        *self.busy = self.receive()? != 0xFF;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            Err(Error::WriteError)
        } else {
            Ok(())
        }
    }

    /// End a multi-block write.
    pub fn write_stop(&mut self) -> Result<(), Error> {
        if !self.wait_ready(self.options.ready_timeout_ms)? {
            return Err(Error::TimeoutWaitNotBusy);
        }
        self.send(STOP_TRAN_TOKEN)
    }
}
