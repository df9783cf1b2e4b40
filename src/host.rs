// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The two sides of a host driver.
//!
//! [`HostController`] is what a register level driver for a concrete SD host
//! controller provides. It never waits: commands are started and then polled
//! so that the protocol layer owns the timeout policy.
//!
//! [`HostDriver`] is what callers program against. [`Slot`](crate::Slot)
//! implements it on top of any [`HostController`].

use crate::cmds::Command;
use crate::common::{BusWidth, Modes, Voltages};
use crate::data::{Data, DataHeader};
use crate::Error;

/// Fixed properties of a host controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Name of the controller, used as the card name.
    pub name: &'static str,

    /// Supply voltages the host can provide.
    pub voltages: Voltages,

    /// Bus modes the host supports.
    pub modes: Modes,

    /// Lowest card clock in Hz.
    pub f_min: u32,

    /// Highest card clock in Hz.
    pub f_max: u32,

    /// Most blocks the controller can move with one command.
    pub max_block_count: u32,
}

/// Bus settings applied by [`HostController::set_ios`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Data bus width.
    pub width: BusWidth,

    /// Card clock in Hz.
    pub clock: u32,

    /// Supply voltage window.
    pub voltage: Voltages,
}

/// Progress of a started command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The hardware has not signalled completion yet.
    Pending,

    /// The command completed and the response words are valid.
    Done,

    /// The command completed and the response words are written, but they
    /// failed the hardware CRC check. Only an error for response types that
    /// carry a CRC.
    CrcFailed,
}

/// Faults a host controller reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerFault {
    /// The hardware timed out waiting for the command response.
    CommandTimeout,

    /// The hardware timed out waiting for data.
    DataTimeout,

    /// A data block failed the CRC check.
    DataCrc {
        /// Index of the failing block within the transfer.
        block: u32,
    },

    /// The card went away while a command was in progress.
    CardRemoved,

    /// Any other hardware error.
    Hardware,
}

/// The register level operations of a concrete SD host controller.
pub trait HostController {
    /// Fixed properties of this controller.
    fn capabilities(&self) -> HostCapabilities;

    /// Reset the controller to its power on state.
    fn reset(&mut self) -> Result<(), ControllerFault>;

    /// Whether the card detect signal reports a card.
    fn card_detect(&mut self) -> bool;

    /// Apply bus width, clock and voltage. The settings are already checked
    /// against [`HostController::capabilities`].
    fn set_ios(&mut self, ios: &BusConfig) -> Result<(), ControllerFault>;

    /// Send a command. If `data` is given the controller prepares for the
    /// transfer that follows the response.
    fn start_command(
        &mut self,
        cmd: &Command,
        data: Option<&DataHeader>,
    ) -> Result<(), ControllerFault>;

    /// Check whether the started command completed. On [`Completion::Done`]
    /// and [`Completion::CrcFailed`] the decoded response words are written
    /// to `response`; a 136 bit response fills all four words with bits
    /// 127:96 first. Nothing is written on a fault.
    fn poll_command(&mut self, response: &mut [u32; 4]) -> Result<Completion, ControllerFault>;

    /// Whether the card holds DAT0 low.
    fn card_busy(&mut self) -> Result<bool, ControllerFault>;

    /// Move the data of the current command into `dest`. Returns the byte
    /// count the hardware reports.
    fn read_data(&mut self, dest: &mut [u8], block_size: u32) -> Result<usize, ControllerFault>;

    /// Move `src` to the card for the current command. Returns the byte
    /// count the hardware reports.
    fn write_data(&mut self, src: &[u8], block_size: u32) -> Result<usize, ControllerFault>;
}

/// The operations callers use to talk to one card slot.
pub trait HostDriver {
    /// Execute a command and its optional data transfer, blocking until it
    /// completes, fails or times out.
    fn send_command(&mut self, cmd: &mut Command, data: Option<&mut Data<'_>>)
        -> Result<(), Error>;

    /// Change the host side bus settings.
    fn configure_bus(&mut self, width: BusWidth, clock: u32, voltage: Voltages)
        -> Result<(), Error>;

    /// Drop everything known about the card and run the full initialization
    /// sequence again.
    fn reinitialize(&mut self) -> Result<(), Error>;

    /// Whether a card is inserted. A removed card resets the card record.
    fn is_card_present(&mut self) -> bool;
}
