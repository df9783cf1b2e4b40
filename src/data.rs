// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Block data attached to a command.

use snafu::ensure;

use crate::{Error, ProtocolViolationSnafu};

/// Direction of a block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Card to host.
    Read,

    /// Host to card.
    Write,
}

/// The buffer bound to a transfer. Exactly one of the two kinds is active.
#[derive(Debug, PartialEq, Eq)]
pub enum DataBuffer<'a> {
    /// Destination for data read from the card.
    Read(&'a mut [u8]),

    /// Source of data written to the card.
    Write(&'a [u8]),
}

impl DataBuffer<'_> {
    /// Length of the bound buffer in bytes.
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::Read(dest) => dest.len(),
            DataBuffer::Write(src) => src.len(),
        }
    }

    /// The bound buffer has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direction implied by the buffer kind.
    pub fn direction(&self) -> Direction {
        match self {
            DataBuffer::Read(_) => Direction::Read,
            DataBuffer::Write(_) => Direction::Write,
        }
    }
}

/// What the host controller needs to know to set up a transfer before the
/// command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Transfer direction.
    pub direction: Direction,

    /// Number of blocks.
    pub block_count: u32,

    /// Bytes per block.
    pub block_size: u32,
}

/// A block transfer: a buffer split into `block_count` blocks of
/// `block_size` bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct Data<'a> {
    buffer: DataBuffer<'a>,
    block_count: u32,
    block_size: u32,
}

impl<'a> Data<'a> {
    /// Bind a buffer to a transfer. The buffer must be exactly
    /// `block_count * block_size` bytes long.
    pub fn new(buffer: DataBuffer<'a>, block_count: u32, block_size: u32) -> Result<Self, Error> {
        check_len(buffer.len(), block_count, block_size)?;

        Ok(Self {
            buffer,
            block_count,
            block_size,
        })
    }

    /// A transfer from the card into `dest`.
    pub fn read(dest: &'a mut [u8], block_count: u32, block_size: u32) -> Result<Self, Error> {
        Self::new(DataBuffer::Read(dest), block_count, block_size)
    }

    /// A transfer from `src` to the card.
    pub fn write(src: &'a [u8], block_count: u32, block_size: u32) -> Result<Self, Error> {
        Self::new(DataBuffer::Write(src), block_count, block_size)
    }

    /// Transfer direction.
    pub fn direction(&self) -> Direction {
        self.buffer.direction()
    }

    /// Number of blocks.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Bytes per block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Total bytes to move.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Always false; a transfer has at least one byte.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The part of the transfer the controller sees up front.
    pub fn header(&self) -> DataHeader {
        DataHeader {
            direction: self.direction(),
            block_count: self.block_count,
            block_size: self.block_size,
        }
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut DataBuffer<'a> {
        &mut self.buffer
    }

    /// The bytes read from the card, if this is a read.
    pub(crate) fn received(&self) -> Option<&[u8]> {
        match &self.buffer {
            DataBuffer::Read(dest) => Some(&dest[..]),
            DataBuffer::Write(_) => None,
        }
    }
}

/// Check that a buffer of `len` bytes holds exactly `block_count` blocks of
/// `block_size` bytes.
pub(crate) fn check_len(len: usize, block_count: u32, block_size: u32) -> Result<(), Error> {
    ensure!(
        block_count > 0 && block_size > 0,
        ProtocolViolationSnafu {
            reason: "empty block transfer"
        }
    );
    ensure!(
        u64::from(block_count) * u64::from(block_size) == len as u64,
        ProtocolViolationSnafu {
            reason: "buffer length is not block_count * block_size"
        }
    );

    Ok(())
}
