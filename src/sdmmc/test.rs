//! A byte level SD card emulator behind [`SpiBus`], and the driver tests
//! that run against it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use hex_literal::hex;

use super::bus::{Clock, ClockSpeed, HalSpiBus, SpiBus};
use super::proto::*;
use super::{CardOptions, Error, SdMmcSpi};
use crate::{Block, BlockCount, BlockIdx, Slot};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Advances by one millisecond every time it is read, so every polling loop
/// makes progress towards its timeout.
pub(crate) struct FakeClock {
    now: Cell<u32>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(ms: u32) -> Self {
        FakeClock { now: Cell::new(ms) }
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(1));
        now
    }

    fn delay_ms(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Model {
    /// SDv2, block addressed
    Sdhc,
    /// SDv2, byte addressed
    Sd2,
    Sd1,
    Mmc,
}

#[derive(Debug)]
enum Mode {
    Command,
    ReadMulti { next: u32 },
    WaitToken { sector: u32, multi: bool },
    Data { sector: u32, multi: bool, buf: Vec<u8> },
}

pub(crate) const SDHC_CSD: [u8; 16] = hex!("400e00325b59000076b27f800a404000");
pub(crate) const SD1_CSD: [u8; 16] = hex!("002600325f5a83c4f6dbbf8716800000");
pub(crate) const FAKE_CID: [u8; 16] = hex!("035344534430384780a1b2c3d4014fff");

pub(crate) struct FakeCard {
    model: Model,
    /// Never answers CMD0 with the idle state.
    pub never_idle: bool,
    /// Stays in the idle state forever.
    pub never_ready: bool,
    /// Echoes a wrong CMD8 check pattern.
    pub bad_pattern: bool,
    /// Never sends a data start token.
    pub no_read_token: bool,
    /// Bytes of DO held low after each accepted data block.
    pub busy_clocks: usize,
    /// ACMD41/CMD1 polls answered with "still idle".
    pub init_polls: u32,
    pub sectors: HashMap<u32, [u8; 512]>,
    /// Every command received, application commands carry `ACMD_FLAG`.
    pub commands: Vec<(u8, u32)>,
    csd: [u8; 16],
    idle: bool,
    app: bool,
    polls_left: u32,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    mode: Mode,
}

impl FakeCard {
    pub fn new(model: Model) -> Self {
        FakeCard {
            model,
            never_idle: false,
            never_ready: false,
            bad_pattern: false,
            no_read_token: false,
            busy_clocks: 4,
            init_polls: 3,
            sectors: HashMap::new(),
            commands: Vec::new(),
            csd: if model == Model::Sdhc { SDHC_CSD } else { SD1_CSD },
            idle: false,
            app: false,
            polls_left: 0,
            frame: Vec::new(),
            out: VecDeque::new(),
            mode: Mode::Command,
        }
    }

    pub fn sector(&self, idx: u32) -> [u8; 512] {
        self.sectors.get(&idx).cloned().unwrap_or([0u8; 512])
    }

    pub fn count(&self, command: u8) -> usize {
        self.commands.iter().filter(|(c, _)| *c == command).count()
    }

    /// Bytes still queued on DO.
    pub fn pending(&self) -> usize {
        self.out.len()
    }

    fn sector_of(&self, arg: u32) -> u32 {
        if self.model == Model::Sdhc {
            arg
        } else {
            arg / 512
        }
    }

    fn push_data(&mut self, data: &[u8]) {
        self.out.push_back(0xFF);
        self.out.push_back(DATA_START_BLOCK);
        self.out.extend(data.iter().cloned());
        self.out.push_back(0x12);
        self.out.push_back(0x34);
    }

    fn push_busy(&mut self) {
        for _ in 0..self.busy_clocks {
            self.out.push_back(0x00);
        }
    }

    fn leave_idle(&mut self) -> u8 {
        if self.never_ready {
            R1_IDLE_STATE
        } else if self.polls_left > 0 {
            self.polls_left -= 1;
            R1_IDLE_STATE
        } else {
            self.idle = false;
            R1_READY_STATE
        }
    }

    fn process(&mut self, command: u8, arg: u32) {
        let code = if self.app {
            command | ACMD_FLAG
        } else {
            command
        };
        self.app = false;
        self.commands.push((code, arg));
        self.out.clear();

        if code == CMD12 {
            self.mode = Mode::Command;
            self.out.extend([0xFF, 0xFF, R1_READY_STATE].iter().cloned());
            return;
        }

        self.out.push_back(0xFF);
        if self.never_idle {
            return;
        }
        let idle = if self.idle { R1_IDLE_STATE } else { 0 };
        let illegal = idle | 0x04;
        match code {
            CMD0 => {
                self.idle = true;
                self.polls_left = self.init_polls;
                self.mode = Mode::Command;
                self.out.push_back(R1_IDLE_STATE);
            }
            CMD8 => match self.model {
                Model::Sdhc | Model::Sd2 => {
                    let pattern = if self.bad_pattern { 0x55 } else { arg as u8 };
                    self.out
                        .extend([idle, 0x00, 0x00, ((arg >> 8) & 0x0F) as u8, pattern].iter().cloned());
                }
                _ => self.out.push_back(illegal),
            },
            CMD55 => {
                if self.model == Model::Mmc {
                    self.out.push_back(illegal);
                } else {
                    self.app = true;
                    self.out.push_back(idle);
                }
            }
            ACMD41 => {
                let r1 = self.leave_idle();
                self.out.push_back(r1);
            }
            CMD1 => {
                if self.model == Model::Mmc {
                    let r1 = self.leave_idle();
                    self.out.push_back(r1);
                } else {
                    self.out.push_back(illegal);
                }
            }
            CMD58 => {
                let ocr0 = if self.model == Model::Sdhc { 0xC0 } else { 0x80 };
                self.out.extend([idle, ocr0, 0xFF, 0x80, 0x00].iter().cloned());
            }
            CMD16 | ACMD23 => self.out.push_back(idle),
            CMD9 => {
                self.out.push_back(R1_READY_STATE);
                let csd = self.csd;
                self.push_data(&csd);
            }
            CMD10 => {
                self.out.push_back(R1_READY_STATE);
                self.push_data(&FAKE_CID);
            }
            ACMD13 => {
                self.out.push_back(R1_READY_STATE);
                self.out.push_back(0x00);
                let mut status = [0u8; 64];
                status[10] = 0x90;
                self.push_data(&status);
            }
            CMD17 => {
                self.out.push_back(R1_READY_STATE);
                if !self.no_read_token {
                    let data = self.sector(self.sector_of(arg));
                    self.push_data(&data);
                }
            }
            CMD18 => {
                self.out.push_back(R1_READY_STATE);
                self.mode = Mode::ReadMulti {
                    next: self.sector_of(arg),
                };
            }
            CMD24 | CMD25 => {
                self.out.push_back(R1_READY_STATE);
                self.mode = Mode::WaitToken {
                    sector: self.sector_of(arg),
                    multi: code == CMD25,
                };
            }
            _ => self.out.push_back(illegal),
        }
    }

    fn parse(&mut self, byte: u8) {
        if self.frame.is_empty() && (byte & 0xC0) != 0x40 {
            return;
        }
        self.frame.push(byte);
        if self.frame.len() == 6 {
            let f = std::mem::take(&mut self.frame);
            let arg = u32::from_be_bytes([f[1], f[2], f[3], f[4]]);
            self.process(f[0] & 0x3F, arg);
        }
    }

    pub fn exchange(&mut self, byte: u8) -> u8 {
        let mode = std::mem::replace(&mut self.mode, Mode::Command);
        self.mode = match mode {
            Mode::Data {
                sector,
                multi,
                mut buf,
            } => {
                buf.push(byte);
                if buf.len() == 514 {
                    let mut data = [0u8; 512];
                    data.copy_from_slice(&buf[..512]);
                    self.sectors.insert(sector, data);
                    self.out.push_back(0xFF);
                    self.out.push_back(0xE5);
                    self.push_busy();
                    if multi {
                        Mode::WaitToken {
                            sector: sector + 1,
                            multi,
                        }
                    } else {
                        Mode::Command
                    }
                } else {
                    Mode::Data { sector, multi, buf }
                }
            }
            Mode::WaitToken { sector, multi } => match byte {
                DATA_START_BLOCK if !multi => Mode::Data {
                    sector,
                    multi,
                    buf: Vec::new(),
                },
                WRITE_MULTIPLE_TOKEN if multi => Mode::Data {
                    sector,
                    multi,
                    buf: Vec::new(),
                },
                STOP_TRAN_TOKEN if multi => {
                    self.out.push_back(0xFF);
                    self.push_busy();
                    Mode::Command
                }
                _ => Mode::WaitToken { sector, multi },
            },
            other => other,
        };

        match self.mode {
            Mode::Data { .. } | Mode::WaitToken { .. } => {}
            _ => self.parse(byte),
        }

        if let Mode::ReadMulti { next } = self.mode {
            if self.out.is_empty() && !self.no_read_token {
                let data = self.sector(next);
                self.push_data(&data);
                self.mode = Mode::ReadMulti { next: next + 1 };
            }
        }

        self.out.pop_front().unwrap_or(0xFF)
    }
}

pub(crate) struct FakeBus {
    pub cards: [Option<FakeCard>; 2],
    pub selected: Option<Slot>,
    pub speed: Option<ClockSpeed>,
    pub protect: [bool; 2],
    pub powered: bool,
}

impl FakeBus {
    pub fn new(card0: Option<FakeCard>, card1: Option<FakeCard>) -> Self {
        FakeBus {
            cards: [card0, card1],
            selected: None,
            speed: None,
            protect: [false, false],
            powered: false,
        }
    }

    pub fn card(&mut self, slot: Slot) -> &mut FakeCard {
        self.cards[slot.index()].as_mut().expect("no card in slot")
    }
}

impl SpiBus for FakeBus {
    type Error = ();

    fn select(&mut self, slot: Slot) -> Result<(), ()> {
        assert!(
            self.selected.is_none(),
            "slot {:?} selected while {:?} still is",
            slot,
            self.selected
        );
        self.selected = Some(slot);
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), ()> {
        self.selected = None;
        Ok(())
    }

    fn exchange(&mut self, byte: u8) -> Result<u8, ()> {
        let reply = match self.selected {
            Some(slot) => match self.cards[slot.index()].as_mut() {
                Some(card) => card.exchange(byte),
                None => 0xFF,
            },
            None => 0xFF,
        };
        Ok(reply)
    }

    fn set_clock(&mut self, speed: ClockSpeed) -> Result<(), ()> {
        self.speed = Some(speed);
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), ()> {
        self.powered = true;
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), ()> {
        self.powered = false;
        Ok(())
    }

    fn card_detected(&mut self, slot: Slot) -> bool {
        self.cards[slot.index()].is_some()
    }

    fn write_protected(&mut self, slot: Slot) -> bool {
        self.protect[slot.index()]
    }
}

pub(crate) fn driver(card0: Option<FakeCard>, card1: Option<FakeCard>) -> SdMmcSpi<FakeBus, FakeClock> {
    init_logging();
    SdMmcSpi::new(FakeBus::new(card0, card1), FakeClock::new())
}

fn pattern_block(seed: u8) -> Block {
    let mut block = Block::new();
    for (i, b) in block.contents.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7).wrapping_add(seed);
    }
    block
}

fn commands(sd: &mut SdMmcSpi<FakeBus, FakeClock>, slot: Slot) -> Vec<(u8, u32)> {
    sd.bus(|bus| bus.card(slot).commands.clone())
}

#[test]
fn sdhc_card_is_block_addressed() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    let status = sd.initialize(Slot::Zero).unwrap();
    assert!(!status.contains(DiskStatus::NOINIT));
    assert_eq!(sd.card_type(Slot::Zero).unwrap(), CardType::SD2 | CardType::BLOCK);
    let cmds = commands(&mut sd, Slot::Zero);
    assert_eq!(cmds[0], (CMD0, 0));
    assert_eq!(cmds[1], (CMD8, IF_COND_PATTERN));
    assert!(cmds.contains(&(ACMD41, HCS_BIT)));
    assert!(cmds.contains(&(CMD58, 0)));
    assert!(!cmds.iter().any(|(c, _)| *c == CMD16));
    assert_eq!(sd.bus(|bus| bus.speed), Some(ClockSpeed::Fast));
}

#[test]
fn byte_addressed_sd2_card() {
    let mut sd = driver(Some(FakeCard::new(Model::Sd2)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.card_type(Slot::Zero).unwrap(), CardType::SD2);

    let block = pattern_block(3);
    sd.write(Slot::Zero, &[block.clone()], BlockIdx(3)).unwrap();
    assert!(commands(&mut sd, Slot::Zero).contains(&(CMD24, 3 * 512)));
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).sector(3)), block.contents);
}

#[test]
fn sd1_card_fixes_block_length() {
    let mut sd = driver(Some(FakeCard::new(Model::Sd1)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.card_type(Slot::Zero).unwrap(), CardType::SD1);
    let cmds = commands(&mut sd, Slot::Zero);
    assert!(cmds.contains(&(ACMD41, 0)));
    assert!(cmds.contains(&(CMD16, 512)));
}

#[test]
fn mmc_card_uses_cmd1() {
    let mut sd = driver(Some(FakeCard::new(Model::Mmc)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.card_type(Slot::Zero).unwrap(), CardType::MMC);
    let cmds = commands(&mut sd, Slot::Zero);
    assert!(cmds.contains(&(CMD1, 0)));
    assert!(cmds.contains(&(CMD16, 512)));
}

#[test]
fn initialize_is_idempotent() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.initialize(Slot::Zero).unwrap();
    let before = commands(&mut sd, Slot::Zero).len();
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(commands(&mut sd, Slot::Zero).len(), before);
}

#[test]
fn card_that_never_goes_idle_is_faulted() {
    let mut card = FakeCard::new(Model::Sdhc);
    card.never_idle = true;
    let mut sd = driver(Some(card), None);
    assert_eq!(sd.initialize(Slot::Zero), Err(Error::NoIdleResponse));
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).count(CMD0)), 5);
    assert!(sd.status(Slot::Zero).contains(DiskStatus::NOINIT));
    assert!(!sd.bus(|bus| bus.powered));
    let mut blocks = [Block::new()];
    assert_eq!(sd.read(Slot::Zero, &mut blocks, BlockIdx(0)), Err(Error::NotReady));
}

#[test]
fn stuck_negotiation_times_out() {
    let mut card = FakeCard::new(Model::Sdhc);
    card.never_ready = true;
    let mut sd = driver(Some(card), None);
    assert_eq!(sd.initialize(Slot::Zero), Err(Error::TimeoutInitialization));
    assert!(sd.status(Slot::Zero).contains(DiskStatus::NOINIT));
    assert_eq!(sd.card_type(Slot::Zero), Err(Error::NotReady));
    assert!(sd.bus(|bus| bus.selected.is_none()));
}

#[test]
fn stuck_old_card_times_out() {
    let mut card = FakeCard::new(Model::Mmc);
    card.never_ready = true;
    let mut sd = driver(Some(card), None);
    assert_eq!(sd.initialize(Slot::Zero), Err(Error::TimeoutInitialization));
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).count(CMD16)), 0);
}

#[test]
fn wrong_check_pattern_is_unsupported() {
    let mut card = FakeCard::new(Model::Sdhc);
    card.bad_pattern = true;
    let mut sd = driver(Some(card), None);
    assert_eq!(sd.initialize(Slot::Zero), Err(Error::UnsupportedCard));
    assert_eq!(sd.initialize(Slot::Zero).unwrap_err().kind(), super::ErrorKind::NotReady);
}

#[test]
fn empty_socket_reports_no_disk() {
    let mut sd = driver(None, None);
    assert_eq!(sd.initialize(Slot::One), Err(Error::CardNotFound));
    assert!(sd.status(Slot::One).contains(DiskStatus::NODISK | DiskStatus::NOINIT));
}

#[test]
fn initialization_survives_clock_wrap() {
    init_logging();
    let bus = FakeBus::new(Some(FakeCard::new(Model::Sdhc)), None);
    let mut sd = SdMmcSpi::new(bus, FakeClock::starting_at(u32::MAX - 3));
    assert!(sd.initialize(Slot::Zero).is_ok());
}

#[test]
fn single_block_round_trip() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.initialize(Slot::Zero).unwrap();
    let block = pattern_block(1);
    sd.write(Slot::Zero, &[block.clone()], BlockIdx(77)).unwrap();
    let mut blocks = [Block::new()];
    sd.read(Slot::Zero, &mut blocks, BlockIdx(77)).unwrap();
    assert_eq!(blocks[0], block);
    assert!(commands(&mut sd, Slot::Zero).contains(&(CMD17, 77)));
}

#[test]
fn multi_block_round_trip() {
    let mut sd = driver(Some(FakeCard::new(Model::Sd1)), None);
    sd.initialize(Slot::Zero).unwrap();
    let blocks = [pattern_block(1), pattern_block(2), pattern_block(3)];
    sd.write(Slot::Zero, &blocks, BlockIdx(10)).unwrap();

    let cmds = commands(&mut sd, Slot::Zero);
    assert!(cmds.contains(&(ACMD23, 3)));
    assert!(cmds.contains(&(CMD25, 10 * 512)));

    let mut read_back = [Block::new(), Block::new(), Block::new()];
    sd.read(Slot::Zero, &mut read_back, BlockIdx(10)).unwrap();
    assert_eq!(read_back, blocks);
    let cmds = commands(&mut sd, Slot::Zero);
    assert!(cmds.contains(&(CMD18, 10 * 512)));
    assert_eq!(cmds.last(), Some(&(CMD12, 0)));
}

#[test]
fn mmc_multi_block_write_skips_count_hint() {
    let mut sd = driver(Some(FakeCard::new(Model::Mmc)), None);
    sd.initialize(Slot::Zero).unwrap();
    sd.write(Slot::Zero, &[pattern_block(4), pattern_block(5)], BlockIdx(0))
        .unwrap();
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).count(ACMD23)), 0);
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).sector(1)), pattern_block(5).contents);
}

#[test]
fn zero_length_transfers_are_rejected() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.read(Slot::Zero, &mut [], BlockIdx(0)), Err(Error::ParameterError));
    assert_eq!(sd.write(Slot::Zero, &[], BlockIdx(0)), Err(Error::ParameterError));
}

#[test]
fn write_protected_card_rejects_writes() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.bus(|bus| bus.protect[0] = true);
    let status = sd.initialize(Slot::Zero).unwrap();
    assert!(status.contains(DiskStatus::PROTECT));
    assert_eq!(
        sd.write(Slot::Zero, &[pattern_block(0)], BlockIdx(0)),
        Err(Error::WriteProtected)
    );
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).count(CMD24)), 0);
    let mut blocks = [Block::new()];
    assert!(sd.read(Slot::Zero, &mut blocks, BlockIdx(0)).is_ok());
}

#[test]
fn missing_data_token_times_out_and_deselects() {
    let mut card = FakeCard::new(Model::Sdhc);
    card.no_read_token = true;
    let mut sd = driver(Some(card), None);
    sd.initialize(Slot::Zero).unwrap();
    let mut blocks = [Block::new()];
    assert_eq!(
        sd.read(Slot::Zero, &mut blocks, BlockIdx(1)),
        Err(Error::TimeoutReadBuffer)
    );
    assert!(sd.bus(|bus| bus.selected.is_none()));

    let mut blocks = [Block::new(), Block::new()];
    assert_eq!(
        sd.read(Slot::Zero, &mut blocks, BlockIdx(1)),
        Err(Error::TimeoutReadBuffer)
    );
    assert_eq!(commands(&mut sd, Slot::Zero).last(), Some(&(CMD12, 0)));
    assert!(sd.bus(|bus| bus.selected.is_none()));
}

#[test]
fn write_leaves_card_busy_until_bus_wait() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert!(!sd.is_busy(Slot::Zero));
    sd.wait_bus_busy(Slot::Zero).unwrap();

    sd.write(Slot::Zero, &[pattern_block(9)], BlockIdx(5)).unwrap();
    assert!(sd.is_busy(Slot::Zero));
    assert!(sd.bus(|bus| bus.card(Slot::Zero).pending()) > 0);

    sd.wait_bus_busy(Slot::Zero).unwrap();
    assert!(!sd.is_busy(Slot::Zero));
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).pending()), 0);
    assert!(sd.bus(|bus| bus.selected.is_none()));
}

#[test]
fn card_without_busy_phase_is_not_flagged() {
    let mut card = FakeCard::new(Model::Sdhc);
    card.busy_clocks = 0;
    let mut sd = driver(Some(card), None);
    sd.initialize(Slot::Zero).unwrap();
    sd.write(Slot::Zero, &[pattern_block(9)], BlockIdx(5)).unwrap();
    assert!(!sd.is_busy(Slot::Zero));
}

#[test]
fn slots_are_independent() {
    let mut sd = driver(
        Some(FakeCard::new(Model::Sdhc)),
        Some(FakeCard::new(Model::Sd1)),
    );
    sd.initialize(Slot::Zero).unwrap();
    sd.initialize(Slot::One).unwrap();
    sd.write(Slot::Zero, &[pattern_block(1)], BlockIdx(2)).unwrap();
    sd.write(Slot::One, &[pattern_block(2)], BlockIdx(2)).unwrap();

    let mut blocks = [Block::new()];
    sd.read(Slot::Zero, &mut blocks, BlockIdx(2)).unwrap();
    assert_eq!(blocks[0], pattern_block(1));
    sd.read(Slot::One, &mut blocks, BlockIdx(2)).unwrap();
    assert_eq!(blocks[0], pattern_block(2));
}

#[test]
fn power_off_forces_new_bring_up() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.initialize(Slot::Zero).unwrap();
    sd.power_off(Slot::Zero).unwrap();
    assert!(sd.status(Slot::Zero).contains(DiskStatus::NOINIT));
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).count(CMD0)), 2);
}

#[test]
fn sdhc_registers() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.sector_count(Slot::Zero).unwrap(), BlockCount((0x76b2 + 1) << 10));
    assert_eq!(sd.erase_block_size(Slot::Zero).unwrap(), 16 << 9);
    assert!(sd.read_ocr(Slot::Zero).unwrap().card_capacity_status());
    let cid = sd.read_cid(Slot::Zero).unwrap();
    assert_eq!(cid.manufacturer_id(), 0x03);
    assert_eq!(cid.product_name(), b"SD08G");
    sd.sync(Slot::Zero).unwrap();
    assert!(sd.bus(|bus| bus.selected.is_none()));
}

#[test]
fn sd1_registers() {
    let mut sd = driver(Some(FakeCard::new(Model::Sd1)), None);
    sd.initialize(Slot::Zero).unwrap();
    assert_eq!(sd.sector_count(Slot::Zero).unwrap(), BlockCount(0xF14 << 10));
    assert_eq!(sd.erase_block_size(Slot::Zero).unwrap(), 256);
}

#[test]
fn queries_need_an_initialized_card() {
    let mut sd = driver(Some(FakeCard::new(Model::Sdhc)), None);
    assert_eq!(sd.sector_count(Slot::Zero), Err(Error::NotReady));
    assert_eq!(sd.read_ocr(Slot::Zero).unwrap_err(), Error::NotReady);
    assert_eq!(sd.sync(Slot::Zero), Err(Error::NotReady));
    assert_eq!(sd.erase_block_size(Slot::Zero), Err(Error::NotReady));
}

#[test]
fn custom_options_limit_reset_attempts() {
    init_logging();
    let mut card = FakeCard::new(Model::Sdhc);
    card.never_idle = true;
    let options = CardOptions {
        reset_attempts: 2,
        ..CardOptions::default()
    };
    let mut sd = SdMmcSpi::new_with_options(FakeBus::new(Some(card), None), FakeClock::new(), options);
    assert!(sd.initialize(Slot::Zero).is_err());
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).count(CMD0)), 2);
}

/// SPI peripheral and chip select pins that forward to one shared
/// [`FakeBus`], for running the driver through [`HalSpiBus`].
struct PinSpi(Rc<RefCell<FakeBus>>);

impl embedded_hal::blocking::spi::Transfer<u8> for PinSpi {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        let mut bus = self.0.borrow_mut();
        for w in words.iter_mut() {
            *w = bus.exchange(*w)?;
        }
        Ok(words)
    }
}

struct ChipSelect {
    slot: Slot,
    bus: Rc<RefCell<FakeBus>>,
}

impl embedded_hal::digital::v2::OutputPin for ChipSelect {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        self.bus.borrow_mut().select(self.slot)
    }

    fn set_high(&mut self) -> Result<(), ()> {
        let mut bus = self.bus.borrow_mut();
        if bus.selected == Some(self.slot) {
            bus.deselect()?;
        }
        Ok(())
    }
}

fn record_speed(spi: &mut PinSpi, speed: ClockSpeed) {
    spi.0.borrow_mut().speed = Some(speed);
}

#[test]
fn hal_bus_drives_both_slots() {
    init_logging();
    let shared = Rc::new(RefCell::new(FakeBus::new(
        Some(FakeCard::new(Model::Sdhc)),
        Some(FakeCard::new(Model::Sd1)),
    )));
    let bus = HalSpiBus::new(
        PinSpi(shared.clone()),
        ChipSelect {
            slot: Slot::Zero,
            bus: shared.clone(),
        },
        ChipSelect {
            slot: Slot::One,
            bus: shared.clone(),
        },
    )
    .with_clock_hook(record_speed);
    let mut sd = SdMmcSpi::new(bus, FakeClock::new());

    sd.initialize(Slot::Zero).unwrap();
    sd.initialize(Slot::One).unwrap();
    assert_eq!(shared.borrow().speed, Some(ClockSpeed::Fast));

    let blocks = [pattern_block(8), pattern_block(9)];
    sd.write(Slot::One, &blocks, BlockIdx(4)).unwrap();
    let mut read_back = [Block::new(), Block::new()];
    sd.read(Slot::One, &mut read_back, BlockIdx(4)).unwrap();
    assert_eq!(read_back, blocks);
    assert!(shared.borrow().selected.is_none());

    let (_spi, _cs0, _cs1) = sd.release().0.release();
}

#[test]
fn borrowed_bus_and_clock() {
    init_logging();
    let mut bus = FakeBus::new(Some(FakeCard::new(Model::Mmc)), None);
    let clock = FakeClock::new();
    {
        let mut sd = SdMmcSpi::new(&mut bus, &clock);
        sd.initialize(Slot::Zero).unwrap();
        sd.write(Slot::Zero, &[pattern_block(6)], BlockIdx(1)).unwrap();
    }
    assert_eq!(bus.card(Slot::Zero).sector(1), pattern_block(6).contents);
}

#[test]
fn byte_address_overflow_is_rejected() {
    let mut sd = driver(Some(FakeCard::new(Model::Sd1)), None);
    sd.initialize(Slot::Zero).unwrap();
    let before = commands(&mut sd, Slot::Zero).len();

    let mut blocks = [Block::new()];
    assert_eq!(
        sd.read(Slot::Zero, &mut blocks, BlockIdx(0x0080_0000)),
        Err(Error::ParameterError)
    );
    assert_eq!(
        sd.write(Slot::Zero, &[pattern_block(1)], BlockIdx(0x00FF_0000)),
        Err(Error::ParameterError)
    );
    assert_eq!(commands(&mut sd, Slot::Zero).len(), before);
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).sector(0)), [0u8; 512]);

    // the last byte addressable block still works
    sd.write(Slot::Zero, &[pattern_block(2)], BlockIdx(0x007F_FFFF))
        .unwrap();
    assert!(commands(&mut sd, Slot::Zero).contains(&(CMD24, 0xFFFF_FE00)));
}

#[test]
fn failed_block_still_ends_multi_block_write() {
    let mut card = FakeCard::new(Model::Sdhc);
    // longer than the 500 ms ready timeout
    card.busy_clocks = 700;
    let mut sd = driver(Some(card), None);
    sd.initialize(Slot::Zero).unwrap();

    let blocks = [pattern_block(1), pattern_block(2)];
    assert_eq!(
        sd.write(Slot::Zero, &blocks, BlockIdx(20)),
        Err(Error::TimeoutWaitNotBusy)
    );
    assert_eq!(sd.bus(|bus| bus.card(Slot::Zero).sector(20)), blocks[0].contents);
    assert!(sd.bus(|bus| bus.selected.is_none()));

    let mut synced = false;
    for _ in 0..5 {
        if sd.sync(Slot::Zero).is_ok() {
            synced = true;
            break;
        }
    }
    assert!(synced);

    let mut read_back = [Block::new()];
    sd.read(Slot::Zero, &mut read_back, BlockIdx(20)).unwrap();
    assert_eq!(read_back[0], blocks[0]);
}
