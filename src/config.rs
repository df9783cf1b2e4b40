// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Timing and retry settings for a [`Slot`](crate::Slot).

/// Wait bounds and initialization settings.
///
/// The defaults give roughly 10 ms for a command, 1 s for busy release and
/// 1 s for the card to power up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Polls of [`HostController::poll_command`](crate::HostController::poll_command)
    /// before a command times out.
    pub command_poll_limit: u32,

    /// Delay between command polls in microseconds.
    pub poll_interval_us: u32,

    /// Polls of the busy signal before an R1b command times out.
    pub busy_poll_limit: u32,

    /// Delay between busy polls in microseconds.
    pub busy_interval_us: u32,

    /// Rounds of ACMD41 before giving up on the card powering up.
    pub op_cond_attempts: u32,

    /// Delay between ACMD41 rounds in microseconds.
    pub op_cond_interval_us: u32,

    /// Clock used during card identification in Hz.
    pub identification_clock: u32,

    /// Check the CRC7 of the CID and CSD registers in software. Only useful
    /// with controllers that keep the CRC byte of long responses.
    pub check_register_crc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_poll_limit: 1000,
            poll_interval_us: 10,
            busy_poll_limit: 10_000,
            busy_interval_us: 100,
            op_cond_attempts: 1000,
            op_cond_interval_us: 1000,
            identification_clock: 400_000,
            check_register_crc: false,
        }
    }
}
