// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! The card identification and setup sequence of section 4.2 of the
//! Simplified Specification.
//!
//! Each step is a separate method so a caller can drive the sequence with
//! its own retry policy; [`Slot::initialize`] runs all of them. A step that
//! fails for an operational reason drops the card back to
//! [`CardState::Absent`]. A [`Error::ProtocolViolation`] means the step was
//! called out of order and leaves the record alone.
//!
//! The steps only pick the commands. Each register is recorded as its
//! response arrives, so the same sequence driven through
//! [`HostDriver::send_command`](crate::HostDriver::send_command) reaches the
//! same states.

use embedded_hal::blocking::delay::DelayUs;
use snafu::prelude::*;

use crate::card::CardState;
use crate::cmds::{self, HostCapacitySupport};
use crate::common::{BusWidth, IF_COND_CHECK_PATTERN, BLOCK_SIZE};
use crate::data::Data;
use crate::host::HostController;
use crate::{Error, NoCardSnafu, ProtocolViolationSnafu, Slot, TimeoutSnafu};

impl<C, D> Slot<C, D>
where
    C: HostController,
    D: DelayUs<u32>,
{
    /// Reset the controller and take the card through the whole sequence to
    /// [`CardState::Ready`].
    pub fn initialize(&mut self) -> Result<(), Error> {
        self.card.remove();
        let result = self.run_initialization();
        if let Err(e) = &result {
            // Failed steps already logged and reset the record.
            if self.card.state() != CardState::Absent {
                log::warn!("{}: initialization failed: {}", self.card.name, e);
                self.card.remove();
            }
        }

        result
    }

    fn run_initialization(&mut self) -> Result<(), Error> {
        self.controller
            .reset()
            .map_err(|fault| crate::transactions::fault_error(fault, 0))?;
        ensure!(self.check_presence(), NoCardSnafu);

        let voltages = self.card.voltages;
        self.apply_bus(BusWidth::One, self.config.identification_clock, voltages)?;

        self.go_idle()?;
        let hcs = if self.send_interface_condition()? {
            HostCapacitySupport::HcOrXcSupported
        } else {
            HostCapacitySupport::ScOnly
        };

        let mut powered_up = false;
        for _ in 0..self.config.op_cond_attempts {
            if self.send_op_cond(hcs)? {
                powered_up = true;
                break;
            }
            self.delay.delay_us(self.config.op_cond_interval_us);
        }
        ensure!(powered_up, TimeoutSnafu { index: 41u16 });

        self.identify()?;
        self.assign_address()?;
        self.read_csd()?;
        self.select()?;
        self.read_scr()?;
        self.configure()?;
        self.finish()?;

        log::info!(
            "{}: card {:?} ready, {:?}, {} blocks of {} bytes, {} bit bus at {} Hz",
            self.card.name,
            core::str::from_utf8(&self.card.product_name()).unwrap_or("?"),
            self.card.version,
            self.card.block_count(),
            self.card.read_bl_len,
            self.card.bus_width.lines(),
            self.card.clock
        );

        Ok(())
    }

    /// GoIdleState. The card stays [`CardState::Detected`].
    pub fn go_idle(&mut self) -> Result<(), Error> {
        let result = self.expect_step(CardState::Detected).and_then(|_| {
            let mut cmd = cmds::go_idle_state();
            self.execute(&mut cmd, None)
        });

        self.settle(result)
    }

    /// SendIfCond. Returns whether the card answered, which only version 2
    /// and later cards do.
    pub fn send_interface_condition(&mut self) -> Result<bool, Error> {
        let result = self.expect_step(CardState::Detected).and_then(|_| {
            let mut cmd = cmds::send_if_cond(IF_COND_CHECK_PATTERN);
            match self.execute(&mut cmd, None) {
                Ok(()) => Ok(true),
                Err(Error::Timeout { .. }) => {
                    log::debug!("{}: no answer to CMD8, version 1 card", self.card.name);
                    self.card.record_interface(false)?;
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        });

        self.settle(result)
    }

    /// One round of SdSendOpCond. Returns `true` once the card finished
    /// powering up and moved to [`CardState::IdentSent`].
    pub fn send_op_cond(&mut self, hcs: HostCapacitySupport) -> Result<bool, Error> {
        let result = self.expect_step(CardState::Detected).and_then(|_| {
            let mut app = cmds::app_cmd(0);
            self.execute_checked(&mut app, None)?;

            let mut cmd = cmds::sd_send_op_cond(hcs, self.card.voltages);
            self.execute(&mut cmd, None)?;

            Ok(self.card.state() == CardState::IdentSent)
        });

        self.settle(result)
    }

    /// AllSendCid. Moves the card to [`CardState::Identified`].
    pub fn identify(&mut self) -> Result<(), Error> {
        let result = self.expect_step(CardState::IdentSent).and_then(|_| {
            let mut cmd = cmds::all_send_cid();
            self.execute(&mut cmd, None)
        });

        self.settle(result)
    }

    /// SendRelativeAddr.
    pub fn assign_address(&mut self) -> Result<(), Error> {
        let result = self.expect_step(CardState::Identified).and_then(|_| {
            let mut cmd = cmds::send_relative_addr();
            self.execute(&mut cmd, None)
        });

        self.settle(result)
    }

    /// SendCsd.
    pub fn read_csd(&mut self) -> Result<(), Error> {
        let result = self
            .expect_step(CardState::Identified)
            .and_then(|_| {
                ensure!(
                    self.card.rca != 0,
                    ProtocolViolationSnafu {
                        reason: "CSD read before the RCA"
                    }
                );
                Ok(())
            })
            .and_then(|_| {
                let mut cmd = cmds::send_csd(self.card.rca);
                self.execute(&mut cmd, None)
            });

        self.settle(result)
    }

    /// SelectCard, putting the card in the transfer state.
    pub fn select(&mut self) -> Result<(), Error> {
        let result = self.expect_step(CardState::Identified).and_then(|_| {
            let mut cmd = cmds::select_card(self.card.rca);
            self.execute_checked(&mut cmd, None).map(|_| ())
        });

        self.settle(result)
    }

    /// SendScr.
    pub fn read_scr(&mut self) -> Result<(), Error> {
        let result = self
            .expect_step(CardState::Identified)
            .and_then(|_| {
                ensure!(
                    self.card.capacity != 0,
                    ProtocolViolationSnafu {
                        reason: "SCR read before the CSD"
                    }
                );
                Ok(())
            })
            .and_then(|_| {
                let mut app = cmds::app_cmd(self.card.rca);
                self.execute_checked(&mut app, None)?;

                let mut buffer = [0; 8];
                let mut data = Data::read(&mut buffer, 1, 8)?;
                let mut cmd = cmds::send_scr();
                self.execute(&mut cmd, Some(&mut data))
            });

        self.settle(result)
    }

    /// Pick the widest bus both sides support and the fastest clock the card
    /// allows. Moves the card to [`CardState::Configured`].
    pub fn configure(&mut self) -> Result<(), Error> {
        let result = self.expect_step(CardState::Identified).and_then(|_| {
            let common = self.card.card_caps & self.card.host_caps;
            let width = if common.contains(BusWidth::Four.required_mode()) {
                BusWidth::Four
            } else {
                BusWidth::One
            };

            if width != BusWidth::One {
                let mut app = cmds::app_cmd(self.card.rca);
                self.execute_checked(&mut app, None)?;
                let mut cmd = cmds::set_bus_width(width).context(ProtocolViolationSnafu {
                    reason: "bus width has no SD encoding",
                })?;
                self.execute_checked(&mut cmd, None)?;
            }

            let clock = self.card.tran_speed.min(self.card.f_max);
            let voltages = self.card.voltages;
            self.apply_bus(width, clock, voltages)?;
            ensure!(
                self.card.state() == CardState::Configured,
                ProtocolViolationSnafu {
                    reason: "card configured before RCA and CSD"
                }
            );

            Ok(())
        });

        self.settle(result)
    }

    /// SetBlockLen to [`BLOCK_SIZE`]. Moves the card to [`CardState::Ready`].
    pub fn finish(&mut self) -> Result<(), Error> {
        let result = self.expect_step(CardState::Configured).and_then(|_| {
            let mut cmd = cmds::set_block_len(BLOCK_SIZE);
            self.execute_checked(&mut cmd, None).map(|_| ())
        });

        self.settle(result)
    }

    fn expect_step(&mut self, state: CardState) -> Result<(), Error> {
        ensure!(self.check_presence(), NoCardSnafu);
        ensure!(
            self.card.state() == state,
            ProtocolViolationSnafu {
                reason: "initialization step out of order"
            }
        );

        Ok(())
    }

    // Everything except a step called out of order treats the card as
    // removed. Register contents the card got wrong are reported as
    // `CommandResponse`, never as `ProtocolViolation`.
    fn settle<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if !matches!(e, Error::ProtocolViolation { .. })
                && self.card.state() != CardState::Absent
            {
                log::warn!("{}: initialization failed: {}", self.card.name, e);
                self.card.remove();
            }
        }

        result
    }
}
