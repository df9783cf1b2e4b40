// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Block level access to a [`CardState::Ready`] card.

use embedded_hal::blocking::delay::DelayUs;
use snafu::prelude::*;

use crate::card::CardState;
use crate::cmds;
use crate::common::BLOCK_SIZE;
use crate::data::Data;
use crate::host::HostController;
use crate::{Error, NoCardSnafu, ProtocolViolationSnafu, Slot};

impl<C, D> Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    /// Whether block I/O is allowed.
    pub fn is_ready(&self) -> bool {
        self.card.is_ready()
    }

    /// Capacity of the card in bytes, zero if it is not initialized.
    pub fn capacity(&self) -> u64 {
        self.card.capacity
    }

    /// Capacity of the card in [`BLOCK_SIZE`] blocks.
    pub fn block_count(&self) -> u64 {
        self.card.block_count()
    }

    /// Read `count` blocks starting at block `start` into `dest`.
    pub fn read_blocks(&mut self, start: u32, count: u32, dest: &mut [u8]) -> Result<(), Error> {
        self.check_range(start, count, dest.len())?;

        let block_len = BLOCK_SIZE as usize;
        let mut done = 0;
        for chunk in dest.chunks_mut(self.card.b_max as usize * block_len) {
            let blocks = (chunk.len() / block_len) as u32;
            let multiple = blocks > 1;

            let block = block_at(start, done)?;
            let mut cmd = cmds::read_blocks(self.card.block_address(block), multiple);
            let mut data = Data::read(chunk, blocks, BLOCK_SIZE)?;
            self.execute_checked(&mut cmd, Some(&mut data))?;
            if multiple {
                self.stop_transmission()?;
            }

            done += u64::from(blocks);
        }

        Ok(())
    }

    /// Write `count` blocks from `src` starting at block `start`.
    pub fn write_blocks(&mut self, start: u32, count: u32, src: &[u8]) -> Result<(), Error> {
        self.check_range(start, count, src.len())?;

        let block_len = BLOCK_SIZE as usize;
        let mut done = 0;
        for chunk in src.chunks(self.card.b_max as usize * block_len) {
            let blocks = (chunk.len() / block_len) as u32;
            let multiple = blocks > 1;

            let block = block_at(start, done)?;
            let mut cmd = cmds::write_blocks(self.card.block_address(block), multiple);
            let mut data = Data::write(chunk, blocks, BLOCK_SIZE)?;
            self.execute_checked(&mut cmd, Some(&mut data))?;
            if multiple {
                self.stop_transmission()?;
            }

            done += u64::from(blocks);
        }

        Ok(())
    }

    /// Erase `count` blocks starting at block `start`.
    pub fn erase_blocks(&mut self, start: u32, count: u32) -> Result<(), Error> {
        self.check_access(start, count)?;
        if count == 0 {
            return Ok(());
        }

        let first = self.card.block_address(start);
        let last = self.card.block_address(block_at(start, u64::from(count) - 1)?);
        self.execute_checked(&mut cmds::erase_start(first), None)?;
        self.execute_checked(&mut cmds::erase_end(last), None)?;
        self.execute_checked(&mut cmds::erase(), None)?;

        log::debug!(
            "{}: erased {} blocks from {}",
            self.card.name,
            count,
            start
        );

        Ok(())
    }

    fn stop_transmission(&mut self) -> Result<(), Error> {
        let mut cmd = cmds::stop_transmission();
        self.execute_checked(&mut cmd, None).map(|_| ())
    }

    fn check_range(&mut self, start: u32, count: u32, len: usize) -> Result<(), Error> {
        self.check_access(start, count)?;
        ensure!(
            len as u64 == u64::from(count) * u64::from(BLOCK_SIZE),
            ProtocolViolationSnafu {
                reason: "buffer length differs from block count"
            }
        );

        Ok(())
    }

    fn check_access(&mut self, start: u32, count: u32) -> Result<(), Error> {
        ensure!(self.check_presence(), NoCardSnafu);
        ensure!(
            self.card.state() == CardState::Ready,
            ProtocolViolationSnafu {
                reason: "block access before initialization completed"
            }
        );
        ensure!(
            u64::from(start) + u64::from(count) <= self.card.block_count(),
            ProtocolViolationSnafu {
                reason: "block range past the end of the card"
            }
        );

        Ok(())
    }
}

// Block `offset` blocks past `start`.
fn block_at(start: u32, offset: u64) -> Result<u32, Error> {
    u32::try_from(u64::from(start) + offset)
        .ok()
        .context(ProtocolViolationSnafu {
            reason: "block number does not fit the command argument",
        })
}
