// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! What the host knows about the card in a slot.
//!
//! The [`Card`] record is filled in register by register as initialization
//! proceeds (OCR, CID, RCA, CSD, SCR, bus settings) and tracks where in that
//! sequence the card is with a [`CardState`]. Each `record_*` method only
//! accepts its register in the right state.

use snafu::ensure;

use crate::common::{crc7, BusWidth, CardCapacity, Modes, Voltages, BLOCK_SIZE};
use crate::host::HostCapabilities;
use crate::resp::{Ocr, ResponseError};
use crate::{CrcMismatchSnafu, Error, ProtocolViolationSnafu, UnsupportedVoltageSnafu};

/// Initialization progress of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No card, or the card failed and is treated as removed.
    Absent,

    /// A card is inserted but has not reported its OCR yet.
    Detected,

    /// The card finished powering up and reported its OCR.
    IdentSent,

    /// The card sent its CID. It gets its RCA and CSD in this state.
    Identified,

    /// Bus width and clock are set from the CSD and SCR.
    Configured,

    /// Block length is set and block I/O is allowed.
    Ready,
}

/// SD Physical Layer version from the SCR.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecVersion {
    Unknown,
    Sd1_0,
    Sd1_10,
    Sd2,
    Sd3,
}

/// The device state record for one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    /// Name of the slot the card is in.
    pub name: &'static str,
    /// Voltages the host supplies.
    pub voltages: Voltages,
    /// Physical layer version.
    pub version: SpecVersion,
    /// Initialization completed.
    pub initialized: bool,
    /// Lowest clock in Hz.
    pub f_min: u32,
    /// Highest clock in Hz.
    pub f_max: u32,
    /// SDHC/SDXC, block addressed.
    pub high_capacity: bool,
    /// Current bus width.
    pub bus_width: BusWidth,
    /// Current clock in Hz.
    pub clock: u32,
    /// Modes the card supports.
    pub card_caps: Modes,
    /// Modes the host supports.
    pub host_caps: Modes,
    /// Operating conditions register.
    pub ocr: u32,
    /// SD configuration register, bits 63:32 first.
    pub scr: [u32; 2],
    /// Card specific data register, bits 127:96 first.
    pub csd: [u32; 4],
    /// Card identification register, bits 127:96 first.
    pub cid: [u32; 4],
    /// Relative card address.
    pub rca: u16,
    /// Partition config (MMC), zero for SD.
    pub part_config: u8,
    /// Current partition (MMC), zero for SD.
    pub part_num: u8,
    /// Maximum transfer rate from the CSD in Hz.
    pub tran_speed: u32,
    /// Read block length in bytes.
    pub read_bl_len: u32,
    /// Write block length in bytes.
    pub write_bl_len: u32,
    /// Erase group size in write blocks.
    pub erase_grp_size: u32,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Most blocks moved by one command.
    pub b_max: u32,
    state: CardState,
}

// Transfer rate units and multipliers of TRAN_SPEED (section 5.3.2), scaled
// so that unit * multiplier is in Hz.
const TRAN_SPEED_UNIT: [u32; 4] = [10_000, 100_000, 1_000_000, 10_000_000];
const TRAN_SPEED_MULT: [u32; 16] = [0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80];

impl Card {
    /// A zeroed record for a slot on the given host.
    pub(crate) fn absent(host: &HostCapabilities) -> Self {
        Self {
            name: host.name,
            voltages: host.voltages,
            version: SpecVersion::Unknown,
            initialized: false,
            f_min: host.f_min,
            f_max: host.f_max,
            high_capacity: false,
            bus_width: BusWidth::One,
            clock: 0,
            card_caps: Modes::empty(),
            host_caps: host.modes,
            ocr: 0,
            scr: [0; 2],
            csd: [0; 4],
            cid: [0; 4],
            rca: 0,
            part_config: 0,
            part_num: 0,
            tran_speed: 0,
            read_bl_len: 0,
            write_bl_len: 0,
            erase_grp_size: 0,
            capacity: 0,
            b_max: host.max_block_count.max(1),
            state: CardState::Absent,
        }
    }

    /// Where in the initialization sequence the card is.
    pub fn state(&self) -> CardState {
        self.state
    }

    /// Block I/O is allowed.
    pub fn is_ready(&self) -> bool {
        self.state == CardState::Ready
    }

    /// Capacity in read blocks.
    pub fn block_count(&self) -> u64 {
        match self.read_bl_len {
            0 => 0,
            len => self.capacity / u64::from(len),
        }
    }

    /// Capacity classification.
    pub fn card_capacity(&self) -> CardCapacity {
        if self.high_capacity {
            CardCapacity::HighOrExtended
        } else {
            CardCapacity::Standard
        }
    }

    /// Address argument for a block: SDHC/SDXC cards are block addressed,
    /// SDSC cards byte addressed.
    pub fn block_address(&self, block: u32) -> u32 {
        if self.high_capacity {
            block
        } else {
            block.wrapping_mul(self.read_bl_len)
        }
    }

    /// Manufacturer id from the CID.
    pub fn manufacturer_id(&self) -> u8 {
        field(&self.cid, 127, 120) as u8
    }

    /// Product name from the CID.
    pub fn product_name(&self) -> [u8; 5] {
        let pnm = wide(&self.cid) >> 64;
        [
            (pnm >> 32) as u8,
            (pnm >> 24) as u8,
            (pnm >> 16) as u8,
            (pnm >> 8) as u8,
            pnm as u8,
        ]
    }

    /// Product serial number from the CID.
    pub fn serial_number(&self) -> u32 {
        field(&self.cid, 55, 24)
    }

    /// Zero the record for a newly detected card.
    pub(crate) fn detected(&mut self) {
        self.clear();
        self.state = CardState::Detected;
    }

    /// Zero the record, the card is gone.
    pub(crate) fn remove(&mut self) {
        self.clear();
        self.state = CardState::Absent;
    }

    fn clear(&mut self) {
        let host = HostCapabilities {
            name: self.name,
            voltages: self.voltages,
            modes: self.host_caps,
            f_min: self.f_min,
            f_max: self.f_max,
            max_block_count: self.b_max,
        };

        *self = Card::absent(&host);
    }

    /// Note whether the card answered SendIfCond.
    pub(crate) fn record_interface(&mut self, v2: bool) -> Result<(), Error> {
        self.expect_state(CardState::Detected)?;
        self.version = if v2 {
            SpecVersion::Sd2
        } else {
            SpecVersion::Sd1_0
        };

        Ok(())
    }

    /// Record the OCR of a card that finished powering up.
    pub(crate) fn record_ocr(&mut self, ocr: Ocr) -> Result<(), Error> {
        self.expect_state(CardState::Detected)?;
        if !ocr.is_powered_up() {
            return Err(rejected(41, ResponseError::PowerUpIncomplete));
        }
        ensure!(
            ocr.voltages().intersects(self.voltages),
            UnsupportedVoltageSnafu
        );

        self.ocr = ocr.bits();
        self.high_capacity = ocr.card_capacity() == CardCapacity::HighOrExtended;
        if self.high_capacity {
            self.card_caps |= Modes::HC;
        }
        self.state = CardState::IdentSent;

        Ok(())
    }

    /// Record the CID.
    pub(crate) fn record_cid(&mut self, cid: [u32; 4], check_crc: bool) -> Result<(), Error> {
        self.expect_state(CardState::IdentSent)?;
        if check_crc {
            ensure!(register_crc_matches(&cid), CrcMismatchSnafu { index: 2u16 });
        }

        self.cid = cid;
        self.state = CardState::Identified;

        Ok(())
    }

    /// Record the address the card published.
    pub(crate) fn record_rca(&mut self, rca: u16) -> Result<(), Error> {
        self.expect_state(CardState::Identified)?;
        if rca == 0 {
            return Err(rejected(3, ResponseError::ZeroRca));
        }

        self.rca = rca;

        Ok(())
    }

    /// Record and decode the CSD.
    pub(crate) fn record_csd(&mut self, csd: [u32; 4], check_crc: bool) -> Result<(), Error> {
        self.expect_state(CardState::Identified)?;
        ensure!(
            self.rca != 0,
            ProtocolViolationSnafu {
                reason: "CSD recorded before the RCA"
            }
        );
        if check_crc {
            ensure!(register_crc_matches(&csd), CrcMismatchSnafu { index: 9u16 });
        }

        let read_bl_len = 1u32 << field(&csd, 83, 80);
        let write_bl_len = 1u32 << field(&csd, 25, 22);

        let capacity = match field(&csd, 127, 126) {
            0 => {
                let c_size = u64::from(field(&csd, 73, 62));
                let c_size_mult = field(&csd, 49, 47);
                ((c_size + 1) << (c_size_mult + 2)) * u64::from(read_bl_len)
            }
            1 => {
                let c_size = u64::from(field(&csd, 69, 48));
                (c_size + 1) * 512 * 1024
            }
            _ => return Err(rejected(9, ResponseError::UnsupportedCsdStructure)),
        };

        let speed = field(&csd, 103, 96) as usize;
        self.tran_speed = TRAN_SPEED_UNIT.get(speed & 0x7).copied().unwrap_or(0)
            * TRAN_SPEED_MULT[(speed >> 3) & 0xf];

        self.erase_grp_size = if field(&csd, 46, 46) == 1 {
            1
        } else {
            field(&csd, 45, 39) + 1
        };

        self.csd = csd;
        self.capacity = capacity;
        self.read_bl_len = read_bl_len.min(BLOCK_SIZE);
        self.write_bl_len = write_bl_len.min(BLOCK_SIZE);

        Ok(())
    }

    /// Record and decode the SCR.
    pub(crate) fn record_scr(&mut self, scr: [u32; 2]) -> Result<(), Error> {
        self.expect_state(CardState::Identified)?;
        ensure!(
            self.capacity != 0,
            ProtocolViolationSnafu {
                reason: "SCR recorded before the CSD"
            }
        );

        let sd_spec = (scr[0] >> 24) & 0xf;
        let sd_spec3 = (scr[0] >> 15) & 0x1;
        self.version = match (sd_spec, sd_spec3) {
            (0, _) => SpecVersion::Sd1_0,
            (1, _) => SpecVersion::Sd1_10,
            (2, 0) => SpecVersion::Sd2,
            (2, _) => SpecVersion::Sd3,
            _ => SpecVersion::Unknown,
        };

        // SD_BUS_WIDTHS bit 2 is 4 bit support; 1 bit is always supported.
        if (scr[0] >> 16) & 0b0100 != 0 {
            self.card_caps |= Modes::BUS_4BIT;
        }

        self.scr = scr;

        Ok(())
    }

    /// Record the bus settings the host applied.
    pub(crate) fn record_bus(&mut self, width: BusWidth, clock: u32) {
        self.bus_width = width;
        self.clock = clock;
    }

    /// The card is set up for data transfer.
    pub(crate) fn mark_configured(&mut self) -> Result<(), Error> {
        self.expect_state(CardState::Identified)?;
        ensure!(
            self.rca != 0 && self.capacity != 0,
            ProtocolViolationSnafu {
                reason: "card configured before RCA and CSD"
            }
        );

        self.state = CardState::Configured;

        Ok(())
    }

    /// The block length is set, initialization is complete.
    pub(crate) fn mark_ready(&mut self, block_len: u32) -> Result<(), Error> {
        self.expect_state(CardState::Configured)?;

        self.read_bl_len = block_len;
        self.write_bl_len = block_len;
        self.initialized = true;
        self.state = CardState::Ready;

        Ok(())
    }

    fn expect_state(&self, state: CardState) -> Result<(), Error> {
        ensure!(
            self.state == state,
            ProtocolViolationSnafu {
                reason: "card register recorded out of order"
            }
        );

        Ok(())
    }
}

// A register the card sent that cannot be used.
fn rejected(index: u16, source: ResponseError) -> Error {
    Error::CommandResponse { index, source }
}

fn wide(words: &[u32; 4]) -> u128 {
    (u128::from(words[0]) << 96)
        | (u128::from(words[1]) << 64)
        | (u128::from(words[2]) << 32)
        | u128::from(words[3])
}

// Bits hi:lo of a 128 bit register, at most 32 bits wide.
fn field(words: &[u32; 4], hi: u32, lo: u32) -> u32 {
    let width = hi - lo + 1;
    let mask = (1u128 << width) - 1;

    ((wide(words) >> lo) & mask) as u32
}

/// Whether the CRC7 field (bits 7:1) of a CID or CSD matches its contents.
pub fn register_crc_matches(words: &[u32; 4]) -> bool {
    let bytes = wide(words).to_be_bytes();

    crc7(&bytes[..15]) == bytes[15] >> 1
}
