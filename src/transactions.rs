// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Executing one command, and its data transfer, against the host
//! controller.
//!
//! Every wait here is a bounded poll: the hardware is asked whether it is
//! done, and if not we delay and ask again until the limit from
//! [`Config`](crate::Config) runs out.

use embedded_hal::blocking::delay::DelayUs;
use snafu::prelude::*;

use crate::card::CardState;
use crate::cmds::Command;
use crate::common::BLOCK_SIZE;
use crate::data::{Data, DataBuffer, Direction};
use crate::host::{Completion, ControllerFault, HostController};
use crate::resp::{CardStatus, InterfaceCondition, Ocr, PublishedRca, ResponseType};
use crate::{
    CommandResponseSnafu, CrcMismatchSnafu, Error, NoCardSnafu, OverrunSnafu,
    ProtocolViolationSnafu, Slot, TimeoutSnafu, UnderrunSnafu,
};

impl<C, D> Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    /// Send `cmd`, wait for its response, move `data` if given and wait for
    /// busy release on R1b.
    ///
    /// On success exactly [`ResponseType::word_count`] words of
    /// `cmd.response` are filled in and the rest are zero, and a register
    /// the card is due to send in its current state is recorded. A failure
    /// never advances the record; it is only reset if the card turns out to
    /// be missing.
    pub(crate) fn execute(
        &mut self,
        cmd: &mut Command,
        mut data: Option<&mut Data<'_>>,
    ) -> Result<(), Error> {
        cmd.response_type.validate()?;
        if let Some(data) = data.as_deref() {
            ensure!(
                !cmd.response_type.is_empty(),
                ProtocolViolationSnafu {
                    reason: "data transfer on a command without response"
                }
            );
            self.check_block_len(data)?;
        }

        ensure!(self.check_presence(), NoCardSnafu);

        cmd.clear_response();
        let header = data.as_deref().map(Data::header);
        log::debug!(
            "{}: CMD{} arg={:#010x} data={:?}",
            self.card.name,
            cmd.index,
            cmd.argument,
            header
        );

        self.controller
            .start_command(cmd, header.as_ref())
            .map_err(|fault| self.fault(fault, cmd.index))?;
        self.wait_for_response(cmd)?;

        if let Some(data) = data.as_deref_mut() {
            self.transfer(cmd.index, data)?;
        }

        if cmd.response_type.contains(ResponseType::BUSY) {
            self.wait_while_busy(cmd.index)?;
        }

        self.record(cmd, data.as_deref())
    }

    /// [`Slot::execute`] followed by a check of the card status in the R1
    /// response.
    pub(crate) fn execute_checked(
        &mut self,
        cmd: &mut Command,
        data: Option<&mut Data<'_>>,
    ) -> Result<CardStatus, Error> {
        self.execute(cmd, data)?;

        card_status(cmd)
    }

    // Only the register the card is due to send in the current state moves
    // the record forward. Anything else leaves it alone.
    fn record(&mut self, cmd: &Command, data: Option<&Data<'_>>) -> Result<(), Error> {
        let word = cmd.response[0];
        let kind = cmd.response_type;

        match (self.card.state(), cmd.index) {
            (CardState::Detected, 8) if kind == ResponseType::R7 => {
                InterfaceCondition::new(word)
                    .check(cmd.argument as u8)
                    .context(CommandResponseSnafu { index: cmd.index })?;
                self.card.record_interface(true)
            }
            (CardState::Detected, 41) if kind == ResponseType::R3 => {
                let ocr = Ocr::new(word);
                if ocr.is_powered_up() {
                    self.card.record_ocr(ocr)?;
                }
                Ok(())
            }
            (CardState::IdentSent, 2) if kind == ResponseType::R2 => self
                .card
                .record_cid(cmd.response, self.config.check_register_crc),
            (CardState::Identified, 3) if kind == ResponseType::R6 => {
                let published = PublishedRca::new(word);
                published
                    .status()
                    .check_error()
                    .context(CommandResponseSnafu { index: cmd.index })?;
                self.card.record_rca(published.rca())
            }
            (CardState::Identified, 9) if kind == ResponseType::R2 && self.card.rca != 0 => self
                .card
                .record_csd(cmd.response, self.config.check_register_crc),
            (CardState::Identified, 51) if kind == ResponseType::R1 && self.card.capacity != 0 => {
                match data.and_then(Data::received) {
                    Some(bytes) if bytes.len() == 8 => {
                        card_status(cmd)?;
                        let (hi, lo) = bytes.split_at(4);
                        self.card.record_scr([be_word(hi), be_word(lo)])
                    }
                    _ => Ok(()),
                }
            }
            (CardState::Configured, 16) if cmd.argument == BLOCK_SIZE => {
                card_status(cmd)?;
                self.card.mark_ready(BLOCK_SIZE)
            }
            _ => Ok(()),
        }
    }

    /// Once the card is initialized only whole blocks of the negotiated
    /// length move.
    fn check_block_len(&self, data: &Data<'_>) -> Result<(), Error> {
        if !self.card.initialized {
            return Ok(());
        }

        let negotiated = match data.direction() {
            Direction::Read => self.card.read_bl_len,
            Direction::Write => self.card.write_bl_len,
        };
        ensure!(
            data.block_size() == negotiated,
            ProtocolViolationSnafu {
                reason: "block size differs from the negotiated block length"
            }
        );

        Ok(())
    }

    fn wait_for_response(&mut self, cmd: &mut Command) -> Result<(), Error> {
        let count = cmd.response_type.word_count();
        let mut words = [0; 4];

        for _ in 0..self.config.command_poll_limit {
            match self.controller.poll_command(&mut words) {
                Ok(Completion::Done) => {
                    cmd.response[..count].copy_from_slice(&words[..count]);
                    return Ok(());
                }
                Ok(Completion::Pending) => self.delay.delay_us(self.config.poll_interval_us),
                // R3 has no valid CRC and some controllers check it anyway.
                Ok(Completion::CrcFailed) if !cmd.response_type.contains(ResponseType::CRC) => {
                    cmd.response[..count].copy_from_slice(&words[..count]);
                    return Ok(());
                }
                Ok(Completion::CrcFailed) => {
                    log::debug!("{}: CMD{} response CRC failed", self.card.name, cmd.index);
                    return CrcMismatchSnafu { index: cmd.index }.fail();
                }
                Err(fault) => return Err(self.fault(fault, cmd.index)),
            }
        }

        log::warn!("{}: CMD{} never completed", self.card.name, cmd.index);
        TimeoutSnafu { index: cmd.index }.fail()
    }

    fn wait_while_busy(&mut self, index: u16) -> Result<(), Error> {
        for _ in 0..self.config.busy_poll_limit {
            let busy = self
                .controller
                .card_busy()
                .map_err(|fault| self.fault(fault, index))?;
            if !busy {
                return Ok(());
            }

            self.delay.delay_us(self.config.busy_interval_us);
        }

        log::warn!("{}: card stayed busy after CMD{}", self.card.name, index);
        TimeoutSnafu { index }.fail()
    }

    /// Move the data of the current command and check that the hardware
    /// moved exactly the whole transfer.
    fn transfer(&mut self, index: u16, data: &mut Data<'_>) -> Result<(), Error> {
        let expected = data.len();
        let block_size = data.block_size();

        let moved = match data.buffer_mut() {
            DataBuffer::Read(dest) => self.controller.read_data(dest, block_size),
            DataBuffer::Write(src) => self.controller.write_data(src, block_size),
        }
        .map_err(|fault| self.fault(fault, index))?;

        ensure!(
            moved >= expected,
            UnderrunSnafu {
                expected,
                actual: moved
            }
        );
        ensure!(
            moved <= expected,
            OverrunSnafu {
                expected,
                actual: moved
            }
        );

        Ok(())
    }

    // A fault that says the card is gone also drops the record.
    fn fault(&mut self, fault: ControllerFault, index: u16) -> Error {
        log::debug!("{}: CMD{} fault {:?}", self.card.name, index, fault);
        if fault == ControllerFault::CardRemoved && self.card.state() != CardState::Absent {
            self.card.remove();
        }

        fault_error(fault, index)
    }
}

fn card_status(cmd: &Command) -> Result<CardStatus, Error> {
    CardStatus::new(cmd.response[0])
        .check_error()
        .context(CommandResponseSnafu { index: cmd.index })
}

fn be_word(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Map a controller fault onto the error taxonomy.
pub(crate) fn fault_error(fault: ControllerFault, index: u16) -> Error {
    match fault {
        ControllerFault::CommandTimeout | ControllerFault::DataTimeout => Error::Timeout { index },
        ControllerFault::DataCrc { .. } => Error::CrcMismatch { index },
        ControllerFault::CardRemoved => Error::NoCard,
        ControllerFault::Hardware => Error::Controller,
    }
}
