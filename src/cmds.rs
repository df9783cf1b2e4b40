// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! SD Card commands and app commands.
//!
//! A [`Command`] is one outgoing command together with the response words
//! the host controller decoded for it. The functions in this module build
//! the commands of the SD bus protocol with their standard response types.
//! App commands (ACMDs) must be preceded by [`app_cmd`].

use crate::common::{BusWidth, Voltages, VOLTAGE_2_7_TO_3_6};
use crate::resp::{Ocr, ResponseType};

/// One command for the card and, after execution, its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Command index.
    pub index: u16,

    /// The response the card is expected to send.
    pub response_type: ResponseType,

    /// Command argument.
    pub argument: u32,

    /// Response words. Only the first [`ResponseType::word_count`] words are
    /// meaningful and only after the command succeeded; the rest are zero.
    ///
    /// For a 136 bit response the first word holds bits 127:96 of the
    /// register.
    pub response: [u32; 4],
}

impl Command {
    /// Create a command with an empty response.
    pub const fn new(index: u16, response_type: ResponseType, argument: u32) -> Self {
        Self {
            index,
            response_type,
            argument,
            response: [0; 4],
        }
    }

    /// The meaningful response words.
    pub fn response_words(&self) -> &[u32] {
        &self.response[..self.response_type.word_count()]
    }

    pub(crate) fn clear_response(&mut self) {
        self.response = [0; 4];
    }
}

/// Encode a GoIdleState command.
pub fn go_idle_state() -> Command {
    Cmd::GoIdleState.with_arg(0)
}

/// Encode a SendIfCond command assuming 2.7-3.6 V as the voltage supplied.
pub fn send_if_cond(check_pattern: u8) -> Command {
    let vhs = u32::from(VOLTAGE_2_7_TO_3_6);
    Cmd::SendIfCond.with_arg((vhs << 8) | u32::from(check_pattern))
}

/// Encode an AppCmd command. The next command should be an application
/// command. `rca` is zero before the card has an address.
pub fn app_cmd(rca: u16) -> Command {
    Cmd::AppCmd.with_arg(rca_arg(rca))
}

/// Encode an SdSendOpCond app command.
pub fn sd_send_op_cond(hcs: HostCapacitySupport, voltages: Voltages) -> Command {
    AppCmd::SdSendOpCond.with_arg(hcs.to_arg() | voltages.bits())
}

/// Encode an AllSendCid command.
pub fn all_send_cid() -> Command {
    Cmd::AllSendCid.with_arg(0)
}

/// Encode a SendRelativeAddr command.
pub fn send_relative_addr() -> Command {
    Cmd::SendRelativeAddr.with_arg(0)
}

/// Encode a SendCsd command.
pub fn send_csd(rca: u16) -> Command {
    Cmd::SendCsd.with_arg(rca_arg(rca))
}

/// Encode a SendCid command.
pub fn send_cid(rca: u16) -> Command {
    Cmd::SendCid.with_arg(rca_arg(rca))
}

/// Encode a SelectCard command.
pub fn select_card(rca: u16) -> Command {
    Cmd::SelectCard.with_arg(rca_arg(rca))
}

/// Encode a SendStatus command.
pub fn send_status(rca: u16) -> Command {
    Cmd::SendStatus.with_arg(rca_arg(rca))
}

/// Encode a SetBlockLen command.
pub fn set_block_len(len: u32) -> Command {
    Cmd::SetBlockLen.with_arg(len)
}

/// Encode a SendScr app command. It reads one 8 byte block.
pub fn send_scr() -> Command {
    AppCmd::SendScr.with_arg(0)
}

/// Encode a SetBusWidth app command, or `None` for a width SD cards do not
/// have.
pub fn set_bus_width(width: BusWidth) -> Option<Command> {
    let arg = match width {
        BusWidth::One => 0b00,
        BusWidth::Four => 0b10,
        BusWidth::Eight => return None,
    };

    Some(AppCmd::SetBusWidth.with_arg(arg))
}

/// Encode a ReadSingleBlock (one block) or ReadMultipleBlock command.
pub fn read_blocks(address: u32, multiple: bool) -> Command {
    if multiple {
        Cmd::ReadMultipleBlock.with_arg(address)
    } else {
        Cmd::ReadSingleBlock.with_arg(address)
    }
}

/// Encode a WriteBlock (one block) or WriteMultipleBlock command.
pub fn write_blocks(address: u32, multiple: bool) -> Command {
    if multiple {
        Cmd::WriteMultipleBlock.with_arg(address)
    } else {
        Cmd::WriteBlock.with_arg(address)
    }
}

/// Encode a StopTransmission command.
pub fn stop_transmission() -> Command {
    Cmd::StopTransmisson.with_arg(0)
}

/// Encode an EraseWrBlkStartAddr command.
pub fn erase_start(address: u32) -> Command {
    Cmd::EraseWrBlkStartAddr.with_arg(address)
}

/// Encode an EraseWrBlkEndAddr command.
pub fn erase_end(address: u32) -> Command {
    Cmd::EraseWrBlkEndAddr.with_arg(address)
}

/// Encode an Erase command.
pub fn erase() -> Command {
    Cmd::Erase.with_arg(0)
}

/// Host support for differend SD Card capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCapacitySupport {
    /// SDSC only host.
    ScOnly,

    /// SDHC or SDXC supported by host.
    HcOrXcSupported,
}

// This enum has the bus mode commands for an SD Card, including ones that
// this package does not use. This is taken from Table 4-22 through
// Table 4-29 of the Simplifed Specification.
#[allow(dead_code)]
#[repr(u16)]
#[derive(Debug, Clone, Copy)]
enum Cmd {
    GoIdleState = 0,
    AllSendCid = 2,
    SendRelativeAddr = 3,
    SwitchFunc = 6,
    SelectCard = 7,
    SendIfCond = 8,
    SendCsd = 9,
    SendCid = 10,
    StopTransmisson = 12,
    SendStatus = 13,
    SetBlockLen = 16,
    ReadSingleBlock = 17,
    ReadMultipleBlock = 18,
    WriteBlock = 24,
    WriteMultipleBlock = 25,
    ProgramCSD = 27,
    EraseWrBlkStartAddr = 32,
    EraseWrBlkEndAddr = 33,
    Erase = 38,
    LockUnlock = 42,
    AppCmd = 55,
    GenCmd = 56,
}

// The application specific commands, from Table 4-32 of the Simplifed
// Specification.
#[allow(dead_code)]
#[repr(u16)]
#[derive(Debug, Clone, Copy)]
enum AppCmd {
    SetBusWidth = 6,
    SdStatus = 13,
    SendNumWrBlocks = 22,
    SetWrBlkEraseCount = 23,
    SdSendOpCond = 41,
    SetClrCardDetect = 42,
    SendScr = 51,
}

impl Encode for Cmd {
    fn index(self) -> u16 {
        self as u16
    }

    fn response_type(self) -> ResponseType {
        match self {
            Cmd::GoIdleState => ResponseType::NONE,
            Cmd::AllSendCid | Cmd::SendCsd | Cmd::SendCid => ResponseType::R2,
            Cmd::SendRelativeAddr => ResponseType::R6,
            Cmd::SendIfCond => ResponseType::R7,
            Cmd::SelectCard | Cmd::StopTransmisson | Cmd::Erase => ResponseType::R1B,
            _ => ResponseType::R1,
        }
    }
}

impl Encode for AppCmd {
    fn index(self) -> u16 {
        self as u16
    }

    fn response_type(self) -> ResponseType {
        match self {
            AppCmd::SdSendOpCond => ResponseType::R3,
            _ => ResponseType::R1,
        }
    }
}

trait Encode: Sized + Copy {
    fn index(self) -> u16;
    fn response_type(self) -> ResponseType;

    fn with_arg(self, arg: u32) -> Command {
        Command::new(self.index(), self.response_type(), arg)
    }
}

impl HostCapacitySupport {
    fn to_arg(self) -> u32 {
        match self {
            HostCapacitySupport::ScOnly => 0,
            HostCapacitySupport::HcOrXcSupported => Ocr::CCS,
        }
    }
}

// The RCA goes in the top half of the argument (section 4.7.4).
fn rca_arg(rca: u16) -> u32 {
    u32::from(rca) << 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_idle_has_no_response() {
        let cmd = go_idle_state();

        assert_eq!(cmd.index, 0);
        assert_eq!(cmd.response_type, ResponseType::NONE);
        assert!(cmd.response_words().is_empty());
    }

    #[test]
    fn send_if_cond_encodes_as_expected() {
        let cmd = send_if_cond(0x42);

        assert_eq!(cmd.index, 8);
        assert_eq!(cmd.argument, 0x0000_0142);
        assert_eq!(cmd.response_type, ResponseType::R7);
    }

    #[test]
    fn sd_send_op_cond_encodes_as_expected() {
        let cmd = sd_send_op_cond(HostCapacitySupport::HcOrXcSupported, Voltages::VDD_32_33);

        assert_eq!(cmd.index, 41);
        assert_eq!(cmd.argument, 0x4010_0000);
        assert_eq!(cmd.response_type, ResponseType::R3);
    }

    #[test]
    fn sc_only_host_leaves_hcs_clear() {
        let cmd = sd_send_op_cond(HostCapacitySupport::ScOnly, Voltages::empty());

        assert_eq!(cmd.argument, 0);
    }

    #[test]
    fn addressed_commands_put_rca_in_high_half() {
        assert_eq!(send_csd(0xbeef).argument, 0xbeef_0000);
        assert_eq!(select_card(0x0001).argument, 0x0001_0000);
        assert_eq!(app_cmd(0x00aa).argument, 0x00aa_0000);
    }

    #[test]
    fn register_reads_expect_long_response() {
        assert_eq!(all_send_cid().response_type, ResponseType::R2);
        assert_eq!(send_csd(1).response_type, ResponseType::R2);
        assert_eq!(send_cid(1).response_type, ResponseType::R2);
    }

    #[test]
    fn busy_commands_expect_r1b() {
        assert_eq!(select_card(1).response_type, ResponseType::R1B);
        assert_eq!(stop_transmission().response_type, ResponseType::R1B);
        assert_eq!(erase().response_type, ResponseType::R1B);
    }

    #[test]
    fn block_commands_pick_single_or_multiple() {
        assert_eq!(read_blocks(7, false).index, 17);
        assert_eq!(read_blocks(7, true).index, 18);
        assert_eq!(write_blocks(7, false).index, 24);
        assert_eq!(write_blocks(7, true).index, 25);
        assert_eq!(write_blocks(7, true).argument, 7);
    }

    #[test]
    fn eight_bit_bus_has_no_sd_encoding() {
        assert_eq!(set_bus_width(BusWidth::Four).map(|c| c.argument), Some(2));
        assert_eq!(set_bus_width(BusWidth::Eight), None);
    }

    #[test]
    fn response_words_follow_response_type() {
        let mut cmd = all_send_cid();
        cmd.response = [1, 2, 3, 4];
        assert_eq!(cmd.response_words(), &[1, 2, 3, 4]);

        let mut cmd = send_status(1);
        cmd.response = [5, 6, 7, 8];
        assert_eq!(cmd.response_words(), &[5]);
    }
}
