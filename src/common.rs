// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Constants and small types from the Simplified Specificiation that are used
//! in more than one module.

use bitflags::bitflags;
use crc::{Crc, CRC_7_MMC};

/// Voltage supplied or accepted nibble.
///
/// This is used as the voltage supplied value (VHS) for a SendIfCond command
/// and as the voltage accepted value when interpreting the R7 response that
/// is returned (Table 4-18 and Table 4-41).
pub const VOLTAGE_2_7_TO_3_6: u8 = 0b0001;

/// The check pattern we send with SendIfCond and expect to be echoed back in
/// the R7 response.
pub const IF_COND_CHECK_PATTERN: u8 = 0b1010_1010;

/// The block length used for all block I/O once the card is ready.
pub const BLOCK_SIZE: u32 = 512;

/// The card capacity classification from section 3.3.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardCapacity {
    /// SDSC card, byte addressed.
    Standard,

    /// SDHC or SDXC card, block addressed.
    HighOrExtended,
}

bitflags! {
    /// The VDD voltage window of the OCR register (Table 5-1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Voltages: u32 {
        /// 2.7-2.8 V
        const VDD_27_28 = 1 << 15;
        /// 2.8-2.9 V
        const VDD_28_29 = 1 << 16;
        /// 2.9-3.0 V
        const VDD_29_30 = 1 << 17;
        /// 3.0-3.1 V
        const VDD_30_31 = 1 << 18;
        /// 3.1-3.2 V
        const VDD_31_32 = 1 << 19;
        /// 3.2-3.3 V
        const VDD_32_33 = 1 << 20;
        /// 3.3-3.4 V
        const VDD_33_34 = 1 << 21;
        /// 3.4-3.5 V
        const VDD_34_35 = 1 << 22;
        /// 3.5-3.6 V
        const VDD_35_36 = 1 << 23;
    }
}

bitflags! {
    /// Bus modes a card or a host can operate in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modes: u32 {
        /// High speed timing.
        const HS = 0x001;
        /// 52 MHz high speed (MMC).
        const HS_52MHZ = 0x010;
        /// 4 data lines.
        const BUS_4BIT = 0x100;
        /// 8 data lines.
        const BUS_8BIT = 0x200;
        /// SPI mode.
        const SPI = 0x400;
        /// High capacity addressing.
        const HC = 0x800;
    }
}

impl Modes {
    /// The bus width bits of the mode mask.
    pub const WIDTH_MASK: Modes = Modes::BUS_4BIT.union(Modes::BUS_8BIT);
}

/// Width of the data bus between host and card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    /// DAT0 only. Every card and host supports this.
    One,

    /// DAT0-DAT3.
    Four,

    /// DAT0-DAT7 (MMC only).
    Eight,
}

impl BusWidth {
    /// The capability bit a host or card needs to use this width.
    pub fn required_mode(self) -> Modes {
        match self {
            BusWidth::One => Modes::empty(),
            BusWidth::Four => Modes::BUS_4BIT,
            BusWidth::Eight => Modes::BUS_8BIT,
        }
    }

    /// Number of data lines.
    pub fn lines(self) -> u8 {
        match self {
            BusWidth::One => 1,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

const CRC7: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);

/// CRC7 as used for commands and for the CID and CSD registers.
pub fn crc7(bytes: &[u8]) -> u8 {
    CRC7.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc7_of_go_idle_matches_known_crc() {
        // GoIdleState is sent with an end byte of 0x95, which is the CRC7
        // 0x4a followed by the stop bit (section 7.2.2).
        assert_eq!(crc7(&[0x40, 0x00, 0x00, 0x00, 0x00]), 0x4a);
    }

    #[test]
    fn one_bit_bus_needs_no_capability() {
        assert!(BusWidth::One.required_mode().is_empty());
        assert_eq!(BusWidth::Four.required_mode(), Modes::BUS_4BIT);
    }

    #[test]
    fn width_mask_covers_wide_buses() {
        assert!(Modes::WIDTH_MASK.contains(Modes::BUS_8BIT));
        assert!(!Modes::WIDTH_MASK.contains(Modes::HS));
    }
}
