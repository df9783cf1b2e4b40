// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The SD/MMC command and response protocol for a card behind a host
//! controller.
//!
//! A [`Slot`] pairs a register level [`HostController`] with the [`Card`]
//! record for the card in that slot. Callers build a [`Command`] (with
//! [`Data`] for block transfers) and execute it through the [`HostDriver`]
//! interface, or use the block level operations once the card is
//! [`CardState::Ready`].
//!
//! Everything is blocking: a command returns when the hardware signals
//! completion, the card releases busy, or the wait bound from [`Config`]
//! runs out. Nothing is retried at this layer.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod blocks;
mod card;
pub mod cmds;
mod common;
mod config;
mod data;
mod host;
mod initialization;
mod resp;
mod transactions;

#[cfg(test)]
mod testutils;

use embedded_hal::blocking::delay::DelayUs;
use embedded_storage::{ReadStorage, Storage};
use snafu::prelude::*;

pub use card::{register_crc_matches, Card, CardState, SpecVersion};
pub use cmds::{Command, HostCapacitySupport};
pub use common::{BusWidth, CardCapacity, Modes, Voltages, BLOCK_SIZE};
pub use config::Config;
pub use data::{Data, DataBuffer, DataHeader, Direction};
pub use host::{
    BusConfig, Completion, ControllerFault, HostCapabilities, HostController, HostDriver,
};
pub use resp::{
    CardStatus, CurrentState, InterfaceCondition, Ocr, PublishedRca, ResponseClass,
    ResponseError, ResponseType,
};

/// The error type for [`Slot`] operations.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// There is no card in the slot.
    #[snafu(display("No card in the slot."))]
    NoCard,

    /// The hardware never signalled completion.
    #[snafu(display("Timeout waiting for CMD{index} to complete."))]
    Timeout {
        /// Index of the command.
        index: u16,
    },

    /// A response or data block failed its CRC check.
    #[snafu(display("CRC check failed for CMD{index}."))]
    CrcMismatch {
        /// Index of the command.
        index: u16,
    },

    /// The request was malformed. This is a bug in the caller.
    #[snafu(display("Protocol violation: {reason}."))]
    ProtocolViolation {
        /// What was wrong.
        reason: &'static str,
    },

    /// The hardware moved fewer bytes than the transfer holds.
    #[snafu(display("Data underrun: expected {expected} bytes, moved {actual}."))]
    Underrun {
        /// Bytes in the transfer.
        expected: usize,
        /// Bytes the hardware reported.
        actual: usize,
    },

    /// The hardware moved more bytes than the transfer holds.
    #[snafu(display("Data overrun: expected {expected} bytes, moved {actual}."))]
    Overrun {
        /// Bytes in the transfer.
        expected: usize,
        /// Bytes the hardware reported.
        actual: usize,
    },

    /// Host and card have no voltage in common.
    #[snafu(display("Unsupported voltage."))]
    UnsupportedVoltage,

    /// The host cannot drive the requested bus width.
    #[snafu(display("Unsupported bus width."))]
    UnsupportedBusWidth,

    /// The card status in a response reported an error.
    #[snafu(display("The response to CMD{index} indicated an error."))]
    CommandResponse {
        /// Index of the command.
        index: u16,
        /// The error the card reported.
        source: ResponseError,
    },

    /// The host controller reported a hardware fault.
    #[snafu(display("Host controller fault."))]
    Controller,
}

impl Error {
    /// Whether this is an expected operational condition the caller may
    /// retry or treat as card removal, rather than a programming error.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Error::NoCard | Error::Timeout { .. } | Error::CrcMismatch { .. }
        )
    }
}

/// One card slot: a host controller and the record of the card in it.
///
/// The slot owns the record exclusively and assumes one command in flight
/// at a time.
pub struct Slot<C, D> {
    controller: C,
    delay: D,
    config: Config,
    card: Card,
}

impl<C, D> Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    /// Create a new [`Slot`] with no card recorded.
    pub fn new(controller: C, delay: D, config: Config) -> Self {
        let card = Card::absent(&controller.capabilities());

        Self {
            controller,
            delay,
            config,
            card,
        }
    }

    /// What is known about the card.
    pub fn card(&self) -> &Card {
        &self.card
    }

    /// Initialization progress of the card.
    pub fn state(&self) -> CardState {
        self.card.state()
    }

    /// The settings this slot uses.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The host controller.
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// The host controller, for board specific setup.
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Give back the controller and delay.
    pub fn release(self) -> (C, D) {
        (self.controller, self.delay)
    }

    /// Sample card detect and update the record: a new card is recorded as
    /// [`CardState::Detected`], a removed one as [`CardState::Absent`].
    pub(crate) fn check_presence(&mut self) -> bool {
        let present = self.controller.card_detect();

        match (present, self.card.state()) {
            (false, CardState::Absent) => {}
            (false, _) => {
                log::warn!("{}: card removed", self.card.name);
                self.card.remove();
            }
            (true, CardState::Absent) => {
                log::debug!("{}: card detected", self.card.name);
                self.card.detected();
            }
            (true, _) => {}
        }

        present
    }

    /// Check and apply host side bus settings. Once the card has its RCA and
    /// CSD this moves it to [`CardState::Configured`].
    pub(crate) fn apply_bus(
        &mut self,
        width: BusWidth,
        clock: u32,
        voltage: Voltages,
    ) -> Result<(), Error> {
        ensure!(
            self.card.host_caps.contains(width.required_mode()),
            UnsupportedBusWidthSnafu
        );
        ensure!(
            !voltage.is_empty() && self.card.voltages.contains(voltage),
            UnsupportedVoltageSnafu
        );

        let clock = clock.clamp(self.card.f_min, self.card.f_max.max(self.card.f_min));
        let ios = BusConfig {
            width,
            clock,
            voltage,
        };
        log::debug!(
            "{}: bus {} bit, {} Hz",
            self.card.name,
            width.lines(),
            clock
        );
        self.controller
            .set_ios(&ios)
            .map_err(|fault| transactions::fault_error(fault, 0))?;
        self.card.record_bus(width, clock);

        // Bus settings applied after the CSD complete the setup.
        if self.card.state() == CardState::Identified
            && self.card.rca != 0
            && self.card.capacity != 0
        {
            self.card.mark_configured()?;
        }

        Ok(())
    }
}

impl<C, D> HostDriver for Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    fn send_command(
        &mut self,
        cmd: &mut Command,
        data: Option<&mut Data<'_>>,
    ) -> Result<(), Error> {
        self.execute(cmd, data)
    }

    fn configure_bus(
        &mut self,
        width: BusWidth,
        clock: u32,
        voltage: Voltages,
    ) -> Result<(), Error> {
        self.apply_bus(width, clock, voltage)
    }

    fn reinitialize(&mut self) -> Result<(), Error> {
        self.initialize()
    }

    fn is_card_present(&mut self) -> bool {
        self.check_presence()
    }
}

impl<C, D> ReadStorage for Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    type Error = Error;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let block_len = BLOCK_SIZE as usize;
        let mut pos = offset as usize;
        let mut done = 0;

        while done < bytes.len() {
            let block = (pos / block_len) as u32;
            let within = pos % block_len;
            let remaining = bytes.len() - done;

            let n = if within == 0 && remaining >= block_len {
                let n = remaining - remaining % block_len;
                self.read_blocks(block, (n / block_len) as u32, &mut bytes[done..done + n])?;
                n
            } else {
                let mut scratch = [0; BLOCK_SIZE as usize];
                self.read_blocks(block, 1, &mut scratch)?;
                let n = remaining.min(block_len - within);
                bytes[done..done + n].copy_from_slice(&scratch[within..within + n]);
                n
            };

            done += n;
            pos += n;
        }

        Ok(())
    }

    fn capacity(&self) -> usize {
        usize::try_from(self.card.capacity).unwrap_or(usize::MAX)
    }
}

impl<C, D> Storage for Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let block_len = BLOCK_SIZE as usize;
        let mut pos = offset as usize;
        let mut done = 0;

        while done < bytes.len() {
            let block = (pos / block_len) as u32;
            let within = pos % block_len;
            let remaining = bytes.len() - done;

            let n = if within == 0 && remaining >= block_len {
                let n = remaining - remaining % block_len;
                self.write_blocks(block, (n / block_len) as u32, &bytes[done..done + n])?;
                n
            } else {
                // Partial block: read, patch and write back.
                let mut scratch = [0; BLOCK_SIZE as usize];
                self.read_blocks(block, 1, &mut scratch)?;
                let n = remaining.min(block_len - within);
                scratch[within..within + n].copy_from_slice(&bytes[done..done + n]);
                self.write_blocks(block, 1, &scratch)?;
                n
            };

            done += n;
            pos += n;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{ready_slot, slot, FakeController};

    #[test]
    fn new_slot_has_no_card() {
        let slot = slot(FakeController::default());

        assert_eq!(slot.state(), CardState::Absent);
        assert_eq!(slot.card().name, "fake-sd");
    }

    #[test]
    fn presence_check_detects_and_removes() {
        let mut slot = slot(FakeController::default());

        assert!(slot.is_card_present());
        assert_eq!(slot.state(), CardState::Detected);

        slot.controller_mut().present = false;
        assert!(!slot.is_card_present());
        assert_eq!(slot.state(), CardState::Absent);
    }

    #[test]
    fn removal_of_ready_card_resets_record() {
        let mut slot = ready_slot(FakeController::default());

        slot.controller_mut().present = false;

        assert!(!slot.is_card_present());
        assert_eq!(slot.state(), CardState::Absent);
        assert!(!slot.card().initialized);
        assert_eq!(slot.card().capacity, 0);
    }

    #[test]
    fn configure_bus_rejects_width_host_lacks() {
        let mut slot = slot(FakeController::default());

        let result = slot.configure_bus(BusWidth::Eight, 25_000_000, Voltages::VDD_32_33);

        assert_eq!(result, Err(Error::UnsupportedBusWidth));
        assert!(slot.controller().bus.is_none());
    }

    #[test]
    fn configure_bus_rejects_voltage_host_lacks() {
        let mut slot = slot(FakeController::default());

        let result = slot.configure_bus(BusWidth::One, 400_000, Voltages::VDD_27_28);

        assert_eq!(result, Err(Error::UnsupportedVoltage));
    }

    #[test]
    fn configure_bus_clamps_clock() {
        let mut slot = slot(FakeController::default());

        slot.configure_bus(BusWidth::Four, 200_000_000, Voltages::VDD_32_33)
            .expect("bus configured");

        let bus = slot.controller().bus.expect("bus applied");
        assert_eq!(bus.clock, 50_000_000);
        assert_eq!(bus.width, BusWidth::Four);
        assert_eq!(slot.card().clock, 50_000_000);
    }

    #[test]
    fn operational_errors_are_retryable() {
        assert!(Error::Timeout { index: 17 }.is_operational());
        assert!(Error::NoCard.is_operational());
        assert!(!Error::ProtocolViolation { reason: "x" }.is_operational());
    }

    #[test]
    fn storage_reads_unaligned_range() {
        let mut fake = FakeController::default();
        for (i, byte) in fake.storage.iter_mut().take(2048).enumerate() {
            *byte = i as u8;
        }
        let mut slot = ready_slot(fake);
        let mut bytes = [0; 600];

        slot.read(100, &mut bytes).expect("read");

        let expected: Vec<u8> = (100..700).map(|i: usize| i as u8).collect();
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn storage_write_patches_partial_block() {
        let mut slot = ready_slot(FakeController::default());

        slot.write(510, &[1, 2, 3, 4]).expect("write");

        let storage = &slot.controller().storage;
        assert_eq!(&storage[508..516], &[0, 0, 1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn storage_capacity_is_card_capacity() {
        let slot = ready_slot(FakeController::default());

        assert_eq!(ReadStorage::capacity(&slot), 2048 * 512);
    }
}
