// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Utilities to support tests.

use embedded_hal_mock::delay::MockNoop;

use crate::cmds::Command;
use crate::common::{self, Modes, Voltages, BLOCK_SIZE};
use crate::config::Config;
use crate::data::DataHeader;
use crate::host::{BusConfig, Completion, ControllerFault, HostCapabilities, HostController};
use crate::resp::{CardStatus, Ocr};
use crate::Slot;

pub const FAKE_RCA: u16 = 0x1234;
pub const FAKE_BLOCKS: usize = 2048;

/// SD 3.0, 1 and 4 bit bus.
pub const SCR_WORDS: [u32; 2] = [0x0205_8000, 0];

const TRAN_STATUS: u32 = CardStatus::READY_FOR_DATA.bits() | (4 << 9);
const ERASED: u8 = 0xff;

pub fn host_capabilities() -> HostCapabilities {
    HostCapabilities {
        name: "fake-sd",
        voltages: Voltages::VDD_32_33 | Voltages::VDD_33_34,
        modes: Modes::HS | Modes::BUS_4BIT,
        f_min: 400_000,
        f_max: 50_000_000,
        max_block_count: 4,
    }
}

/// A CID with MID 0x03, OID "SD", PNM "FAKE1" and PSN 0xdeadbeef.
pub fn cid_words() -> [u32; 4] {
    let mut cid = 0x03u128 << 120;
    cid |= u128::from(u16::from_be_bytes(*b"SD")) << 104;
    for (i, byte) in b"FAKE1".iter().enumerate() {
        cid |= u128::from(*byte) << (96 - 8 * i);
    }
    cid |= 0x10u128 << 56;
    cid |= 0xdead_beefu128 << 24;
    cid |= 0x0123u128 << 8;

    with_crc(cid)
}

/// A version 1.0 CSD.
pub fn csd_v1_words(c_size: u32, c_size_mult: u32, read_bl_len: u32) -> [u32; 4] {
    let mut csd = 0x32u128 << 96;
    csd |= 0x5b5u128 << 84;
    csd |= u128::from(read_bl_len) << 80;
    csd |= u128::from(c_size) << 62;
    csd |= u128::from(c_size_mult) << 47;
    csd |= 0x7fu128 << 39;
    csd |= u128::from(read_bl_len) << 22;

    with_crc(csd)
}

/// A version 2.0 CSD, `(c_size + 1) * 512 KiB` large.
pub fn csd_v2_words(c_size: u32) -> [u32; 4] {
    let mut csd = 1u128 << 126;
    csd |= 0x32u128 << 96;
    csd |= 0x5b5u128 << 84;
    csd |= 9u128 << 80;
    csd |= u128::from(c_size) << 48;
    csd |= 1u128 << 46;
    csd |= 0x7fu128 << 39;
    csd |= 9u128 << 22;

    with_crc(csd)
}

fn with_crc(register: u128) -> [u32; 4] {
    let mut bytes = register.to_be_bytes();
    bytes[15] = (common::crc7(&bytes[..15]) << 1) | 1;
    let register = u128::from_be_bytes(bytes);

    [
        (register >> 96) as u32,
        (register >> 64) as u32,
        (register >> 32) as u32,
        register as u32,
    ]
}

/// How the fake reports the byte count of a data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeData {
    #[default]
    Exact,
    /// One block less than asked for.
    Short,
    /// One block more than asked for.
    Long,
}

#[derive(Debug)]
pub(crate) enum Pending {
    Idle,
    Hung,
    Response([u32; 4]),
    CrcFailed([u32; 4]),
    Fault(ControllerFault),
}

/// A host controller with an SD card behind it, backed by memory.
#[derive(Debug)]
pub struct FakeController {
    pub present: bool,
    pub modes: Modes,
    pub version_1: bool,
    pub power_up_rounds: u32,
    pub bad_check_pattern: bool,
    pub zero_rca: bool,
    pub c_size: u32,
    pub hang_on: Option<u16>,
    pub crc_fail_on: Option<u16>,
    pub remove_on: Option<u16>,
    pub status_error: Option<u16>,
    pub stuck_busy: bool,
    pub data: FakeData,

    pub issued: Vec<(u16, u32)>,
    pub bus: Option<BusConfig>,
    pub resets: u32,
    pub storage: Vec<u8>,

    pub(crate) pending: Pending,
    pub(crate) app: bool,
    pub(crate) cursor: Option<usize>,
    pub(crate) scr_pending: bool,
    pub(crate) erase_start: u32,
    pub(crate) erase_end: u32,
}

impl Default for FakeController {
    fn default() -> Self {
        Self {
            present: true,
            modes: host_capabilities().modes,
            version_1: false,
            power_up_rounds: 0,
            bad_check_pattern: false,
            zero_rca: false,
            c_size: 1,
            hang_on: None,
            crc_fail_on: None,
            remove_on: None,
            status_error: None,
            stuck_busy: false,
            data: FakeData::Exact,
            issued: Vec::new(),
            bus: None,
            resets: 0,
            storage: vec![0; FAKE_BLOCKS * BLOCK_SIZE as usize],
            pending: Pending::Idle,
            app: false,
            cursor: None,
            scr_pending: false,
            erase_start: 0,
            erase_end: 0,
        }
    }
}

impl FakeController {
    // Storage is mirrored across the whole card.
    fn offset(&self, address: u32) -> usize {
        let block = if self.version_1 {
            address / BLOCK_SIZE
        } else {
            address
        };

        (block as usize * BLOCK_SIZE as usize) % self.storage.len()
    }

    fn status(&self, index: u16) -> u32 {
        let mut status = TRAN_STATUS;
        if self.status_error == Some(index) {
            status |= CardStatus::ERROR.bits();
        }

        status
    }

    fn respond(&mut self, index: u16, arg: u32, app: bool) -> Result<[u32; 4], ControllerFault> {
        let r1 = [self.status(index), 0, 0, 0];

        match (index, app) {
            (0, _) => Ok([0; 4]),
            (8, _) if self.version_1 => Err(ControllerFault::CommandTimeout),
            (8, _) if self.bad_check_pattern => Ok([(arg & 0xf00) | 0x55, 0, 0, 0]),
            (8, _) => Ok([arg & 0xfff, 0, 0, 0]),
            (55, _) => Ok([self.status(index) | CardStatus::APP_CMD.bits(), 0, 0, 0]),
            (41, true) => {
                if self.power_up_rounds > 0 {
                    self.power_up_rounds -= 1;
                    return Ok([0x00ff_8000, 0, 0, 0]);
                }
                let ccs = if self.version_1 { 0 } else { arg & Ocr::CCS };
                Ok([Ocr::BUSY | 0x00ff_8000 | ccs, 0, 0, 0])
            }
            (2, _) | (10, _) => Ok(cid_words()),
            (3, _) if self.zero_rca => Ok([0x0500, 0, 0, 0]),
            (3, _) => Ok([(u32::from(FAKE_RCA) << 16) | 0x0500, 0, 0, 0]),
            (9, _) if self.version_1 => Ok(csd_v1_words(511, 0, 9)),
            (9, _) => Ok(csd_v2_words(self.c_size)),
            (51, true) => {
                self.scr_pending = true;
                Ok(r1)
            }
            (17, _) | (18, _) | (24, _) | (25, _) => {
                self.cursor = Some(self.offset(arg));
                Ok(r1)
            }
            (32, _) => {
                self.erase_start = arg;
                Ok(r1)
            }
            (33, _) => {
                self.erase_end = arg;
                Ok(r1)
            }
            (38, _) => {
                let start = self.offset(self.erase_start);
                let end = self.offset(self.erase_end) + BLOCK_SIZE as usize;
                if let Some(range) = self.storage.get_mut(start..end.max(start)) {
                    range.fill(ERASED);
                }
                Ok(r1)
            }
            (6, true) | (7, _) | (12, _) | (13, _) | (16, _) => Ok(r1),
            _ => Err(ControllerFault::CommandTimeout),
        }
    }

    fn reported(&self, len: usize, block_size: u32) -> usize {
        match self.data {
            FakeData::Exact => len,
            FakeData::Short => len.saturating_sub(block_size as usize),
            FakeData::Long => len + block_size as usize,
        }
    }
}

impl HostController for FakeController {
    fn capabilities(&self) -> HostCapabilities {
        HostCapabilities {
            modes: self.modes,
            ..host_capabilities()
        }
    }

    fn reset(&mut self) -> Result<(), ControllerFault> {
        self.resets += 1;
        self.pending = Pending::Idle;
        self.app = false;
        Ok(())
    }

    fn card_detect(&mut self) -> bool {
        self.present
    }

    fn set_ios(&mut self, ios: &BusConfig) -> Result<(), ControllerFault> {
        self.bus = Some(*ios);
        Ok(())
    }

    fn start_command(
        &mut self,
        cmd: &Command,
        _data: Option<&DataHeader>,
    ) -> Result<(), ControllerFault> {
        self.issued.push((cmd.index, cmd.argument));
        let app = core::mem::replace(&mut self.app, false);

        if self.remove_on == Some(cmd.index) {
            self.present = false;
            return Err(ControllerFault::CardRemoved);
        }

        self.pending = if self.hang_on == Some(cmd.index) {
            Pending::Hung
        } else {
            match self.respond(cmd.index, cmd.argument, app) {
                Ok(words) if self.crc_fail_on == Some(cmd.index) => Pending::CrcFailed(words),
                Ok(words) => Pending::Response(words),
                Err(fault) => Pending::Fault(fault),
            }
        };
        self.app = cmd.index == 55;

        Ok(())
    }

    fn poll_command(&mut self, response: &mut [u32; 4]) -> Result<Completion, ControllerFault> {
        match core::mem::replace(&mut self.pending, Pending::Idle) {
            Pending::Idle => Err(ControllerFault::Hardware),
            Pending::Hung => {
                self.pending = Pending::Hung;
                Ok(Completion::Pending)
            }
            Pending::Response(words) => {
                *response = words;
                Ok(Completion::Done)
            }
            Pending::CrcFailed(words) => {
                *response = words;
                Ok(Completion::CrcFailed)
            }
            Pending::Fault(fault) => Err(fault),
        }
    }

    fn card_busy(&mut self) -> Result<bool, ControllerFault> {
        Ok(self.stuck_busy)
    }

    fn read_data(&mut self, dest: &mut [u8], block_size: u32) -> Result<usize, ControllerFault> {
        if core::mem::replace(&mut self.scr_pending, false) {
            let mut scr = [0; 8];
            scr[..4].copy_from_slice(&SCR_WORDS[0].to_be_bytes());
            scr[4..].copy_from_slice(&SCR_WORDS[1].to_be_bytes());
            let n = dest.len().min(scr.len());
            dest[..n].copy_from_slice(&scr[..n]);
            return Ok(self.reported(dest.len(), block_size));
        }

        let start = self.cursor.take().ok_or(ControllerFault::DataTimeout)?;
        let src = self
            .storage
            .get(start..start + dest.len())
            .ok_or(ControllerFault::DataTimeout)?;
        dest.copy_from_slice(src);

        Ok(self.reported(dest.len(), block_size))
    }

    fn write_data(&mut self, src: &[u8], block_size: u32) -> Result<usize, ControllerFault> {
        let start = self.cursor.take().ok_or(ControllerFault::DataTimeout)?;
        let dest = self
            .storage
            .get_mut(start..start + src.len())
            .ok_or(ControllerFault::DataTimeout)?;
        dest.copy_from_slice(src);

        Ok(self.reported(src.len(), block_size))
    }
}

pub fn test_config() -> Config {
    Config {
        command_poll_limit: 8,
        poll_interval_us: 0,
        busy_poll_limit: 8,
        busy_interval_us: 0,
        op_cond_attempts: 4,
        op_cond_interval_us: 0,
        ..Default::default()
    }
}

pub fn slot(fake: FakeController) -> Slot<FakeController, MockNoop> {
    Slot::new(fake, MockNoop::new(), test_config())
}

/// A slot whose card went through initialization. Fault injection set on
/// `fake` only applies after initialization.
pub fn ready_slot(mut fake: FakeController) -> Slot<FakeController, MockNoop> {
    let data = core::mem::take(&mut fake.data);
    let stuck_busy = core::mem::replace(&mut fake.stuck_busy, false);

    let mut slot = slot(fake);
    slot.initialize().expect("card initializes");

    let fake = slot.controller_mut();
    fake.data = data;
    fake.stuck_busy = stuck_busy;
    fake.issued.clear();

    slot
}
