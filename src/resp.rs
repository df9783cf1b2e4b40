// Copyright 2022 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Types to describe and decode SD Card responses.
//!
//! [`ResponseType`] is the shape the host controller should expect for a
//! command: whether there is a response at all, whether it is 48 or 136 bits
//! long, whether it carries a CRC and the command index, and whether the card
//! may hold DAT0 low (busy) afterwards. The named combinations match the
//! response classes of section 4.9 of the Simplified Specification.
//!
//! The remaining types decode the response words once a command completes:
//!     - [`CardStatus`] for R1 and R1b
//!     - [`Ocr`] for R3
//!     - [`PublishedRca`] for R6
//!     - [`InterfaceCondition`] for R7
//!
//! R2 responses are raw CID or CSD registers and are decoded by the
//! [`Card`](crate::Card) record.

use bitflags::bitflags;
use snafu::{ensure, Snafu};

use crate::common::{CardCapacity, Voltages, VOLTAGE_2_7_TO_3_6};
use crate::{Error, ProtocolViolationSnafu};

bitflags! {
    /// Flags describing the expected response to a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResponseType: u32 {
        /// The card sends a response.
        const PRESENT = 1 << 0;
        /// The response is 136 bits long.
        const LENGTH_136 = 1 << 1;
        /// The response carries a valid CRC7.
        const CRC = 1 << 2;
        /// The card may signal busy on DAT0 after the response.
        const BUSY = 1 << 3;
        /// The response echoes the command index.
        const OPCODE = 1 << 4;
    }
}

impl ResponseType {
    /// No response.
    pub const NONE: ResponseType = ResponseType::empty();

    /// Normal response.
    pub const R1: ResponseType = ResponseType::PRESENT
        .union(ResponseType::CRC)
        .union(ResponseType::OPCODE);

    /// Normal response with busy.
    pub const R1B: ResponseType = ResponseType::R1.union(ResponseType::BUSY);

    /// CID or CSD register.
    pub const R2: ResponseType = ResponseType::PRESENT
        .union(ResponseType::LENGTH_136)
        .union(ResponseType::CRC);

    /// OCR register. The CRC field of this response is all ones.
    pub const R3: ResponseType = ResponseType::PRESENT;

    /// Fast I/O (MMC) or I/O OCR (SDIO).
    pub const R4: ResponseType = ResponseType::PRESENT;

    /// Interrupt request (MMC) or I/O RW response (SDIO).
    pub const R5: ResponseType = ResponseType::R1;

    /// Published RCA.
    pub const R6: ResponseType = ResponseType::R1;

    /// Card interface condition.
    pub const R7: ResponseType = ResponseType::R1;

    /// Check the flag combination before a command is issued.
    ///
    /// A 136 bit response never reports busy or echoes the opcode, and no
    /// other flag makes sense without [`ResponseType::PRESENT`].
    pub fn validate(self) -> Result<ResponseType, Error> {
        ensure!(
            self.contains(ResponseType::PRESENT) || self.is_empty(),
            ProtocolViolationSnafu {
                reason: "response flags set without a response"
            }
        );
        ensure!(
            !(self.contains(ResponseType::LENGTH_136)
                && self.intersects(ResponseType::BUSY | ResponseType::OPCODE)),
            ProtocolViolationSnafu {
                reason: "136 bit response with busy or opcode"
            }
        );

        Ok(self)
    }

    /// Build a response type from a raw mask, rejecting unknown bits and
    /// invalid combinations.
    pub fn from_raw(bits: u32) -> Result<ResponseType, Error> {
        ResponseType::from_bits(bits)
            .ok_or_else(|| {
                ProtocolViolationSnafu {
                    reason: "unknown response flag",
                }
                .build()
            })?
            .validate()
    }

    /// Number of meaningful response words once the command completes.
    pub fn word_count(self) -> usize {
        if !self.contains(ResponseType::PRESENT) {
            0
        } else if self.contains(ResponseType::LENGTH_136) {
            4
        } else {
            1
        }
    }
}

impl Default for ResponseType {
    fn default() -> Self {
        ResponseType::NONE
    }
}

/// The named response classes.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    None,
    R1,
    R1b,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

impl ResponseClass {
    /// Every class, in order.
    pub const ALL: [ResponseClass; 9] = [
        ResponseClass::None,
        ResponseClass::R1,
        ResponseClass::R1b,
        ResponseClass::R2,
        ResponseClass::R3,
        ResponseClass::R4,
        ResponseClass::R5,
        ResponseClass::R6,
        ResponseClass::R7,
    ];

    /// The fixed flag combination for this class.
    pub fn flags(self) -> ResponseType {
        match self {
            ResponseClass::None => ResponseType::NONE,
            ResponseClass::R1 => ResponseType::R1,
            ResponseClass::R1b => ResponseType::R1B,
            ResponseClass::R2 => ResponseType::R2,
            ResponseClass::R3 => ResponseType::R3,
            ResponseClass::R4 => ResponseType::R4,
            ResponseClass::R5 => ResponseType::R5,
            ResponseClass::R6 => ResponseType::R6,
            ResponseClass::R7 => ResponseType::R7,
        }
    }
}

impl From<ResponseClass> for ResponseType {
    fn from(class: ResponseClass) -> Self {
        class.flags()
    }
}

/// Errors a card can report in a decoded response.
#[allow(missing_docs)]
#[derive(Debug, PartialEq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResponseError {
    #[snafu(display("SD Card detected an illegal command."))]
    IllegalCommand,

    #[snafu(display("SD Card detected a CRC check failure."))]
    ComCrcError,

    #[snafu(display("SD Card detected an argument out of range."))]
    OutOfRange,

    #[snafu(display("SD Card detected an address error."))]
    AddressError,

    #[snafu(display("SD Card detected a block length error."))]
    BlockLenError,

    #[snafu(display("SD Card detected an erase seqeuence error."))]
    EraseSequenceError,

    #[snafu(display("SD Card detected an invalid erase selection."))]
    EraseParamError,

    #[snafu(display("SD Card detected a write protect violation."))]
    WriteProtectViolation,

    #[snafu(display("SD Card failed to lock or unlock."))]
    LockUnlockFailed,

    #[snafu(display("SD Card internal ECC failed to correct the data."))]
    CardEccFailed,

    #[snafu(display("SD Card internal controller error."))]
    CardControllerError,

    #[snafu(display("SD Card reported a general error."))]
    GeneralError,

    #[snafu(display("SD Card responded with an unexpected voltage."))]
    UnexpectVoltage,

    #[snafu(display("SD Card responded with unexpected check pattern."))]
    CheckPatternMismatch,

    #[snafu(display("SD Card published a zero relative address."))]
    ZeroRca,

    #[snafu(display("SD Card reported an OCR before it finished powering up."))]
    PowerUpIncomplete,

    #[snafu(display("SD Card has an unsupported CSD structure."))]
    UnsupportedCsdStructure,
}

bitflags! {
    /// The 32 bit card status returned in R1 and R1b (section 4.10.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CardStatus: u32 {
        /// Argument was out of range.
        const OUT_OF_RANGE = 1 << 31;
        /// Misaligned address.
        const ADDRESS_ERROR = 1 << 30;
        /// Block length not allowed.
        const BLOCK_LEN_ERROR = 1 << 29;
        /// Error in the erase command sequence.
        const ERASE_SEQ_ERROR = 1 << 28;
        /// Invalid selection of blocks to erase.
        const ERASE_PARAM = 1 << 27;
        /// Write to a protected block.
        const WP_VIOLATION = 1 << 26;
        /// The card is locked by the host.
        const CARD_IS_LOCKED = 1 << 25;
        /// Lock/unlock command failed.
        const LOCK_UNLOCK_FAILED = 1 << 24;
        /// CRC check of the previous command failed.
        const COM_CRC_ERROR = 1 << 23;
        /// Command not legal for the card state.
        const ILLEGAL_COMMAND = 1 << 22;
        /// Card ECC failed.
        const CARD_ECC_FAILED = 1 << 21;
        /// Internal card controller error.
        const CC_ERROR = 1 << 20;
        /// General or unknown error.
        const ERROR = 1 << 19;
        /// The buffer is empty on the bus.
        const READY_FOR_DATA = 1 << 8;
        /// The card will interpret the next command as an ACMD.
        const APP_CMD = 1 << 5;
    }
}

/// The CURRENT_STATE field of the card status.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentState {
    Idle,
    Ready,
    Ident,
    Standby,
    Transfer,
    Data,
    Receive,
    Program,
    Disconnect,
    Reserved(u8),
}

impl CardStatus {
    /// Decode the first response word.
    pub fn new(value: u32) -> Self {
        CardStatus::from_bits_retain(value)
    }

    /// Turn the first error bit found into an error.
    pub fn check_error(self) -> Result<CardStatus, ResponseError> {
        ensure!(
            !self.contains(CardStatus::ILLEGAL_COMMAND),
            IllegalCommandSnafu
        );
        ensure!(!self.contains(CardStatus::COM_CRC_ERROR), ComCrcSnafu);
        ensure!(!self.contains(CardStatus::OUT_OF_RANGE), OutOfRangeSnafu);
        ensure!(!self.contains(CardStatus::ADDRESS_ERROR), AddressSnafu);
        ensure!(!self.contains(CardStatus::BLOCK_LEN_ERROR), BlockLenSnafu);
        ensure!(
            !self.contains(CardStatus::ERASE_SEQ_ERROR),
            EraseSequenceSnafu
        );
        ensure!(!self.contains(CardStatus::ERASE_PARAM), EraseParamSnafu);
        ensure!(
            !self.contains(CardStatus::WP_VIOLATION),
            WriteProtectViolationSnafu
        );
        ensure!(
            !self.contains(CardStatus::LOCK_UNLOCK_FAILED),
            LockUnlockFailedSnafu
        );
        ensure!(
            !self.contains(CardStatus::CARD_ECC_FAILED),
            CardEccFailedSnafu
        );
        ensure!(
            !self.contains(CardStatus::CC_ERROR),
            CardControllerSnafu
        );
        ensure!(!self.contains(CardStatus::ERROR), GeneralSnafu);

        Ok(self)
    }

    /// The state the card was in when it sent the status.
    pub fn current_state(self) -> CurrentState {
        match (self.bits() >> 9) & 0xf {
            0 => CurrentState::Idle,
            1 => CurrentState::Ready,
            2 => CurrentState::Ident,
            3 => CurrentState::Standby,
            4 => CurrentState::Transfer,
            5 => CurrentState::Data,
            6 => CurrentState::Receive,
            7 => CurrentState::Program,
            8 => CurrentState::Disconnect,
            other => CurrentState::Reserved(other as u8),
        }
    }
}

/// Newtype to decode the R3 response (the OCR register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ocr(u32);

impl Ocr {
    /// Power up status bit, set once the card finished its power up routine.
    pub const BUSY: u32 = 1 << 31;

    /// Card capacity status; also the host capacity support bit in ACMD41.
    pub const CCS: u32 = 1 << 30;

    /// Decode the response word.
    pub fn new(value: u32) -> Self {
        Ocr(value)
    }

    /// Raw register value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// The card finished powering up. CCS is only valid once this is set.
    pub fn is_powered_up(self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Capacity classification from the CCS bit.
    pub fn card_capacity(self) -> CardCapacity {
        if self.0 & Self::CCS == 0 {
            CardCapacity::Standard
        } else {
            CardCapacity::HighOrExtended
        }
    }

    /// The voltage window the card accepts.
    pub fn voltages(self) -> Voltages {
        Voltages::from_bits_truncate(self.0)
    }
}

/// Newtype to decode the R6 response (published RCA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedRca(u32);

impl PublishedRca {
    /// Decode the response word.
    pub fn new(value: u32) -> Self {
        PublishedRca(value)
    }

    /// The relative card address.
    pub fn rca(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The condensed status bits expanded back into a card status
    /// (section 4.9.5).
    pub fn status(self) -> CardStatus {
        let low = self.0 & 0xffff;
        let bits = ((low & 0x8000) << 8) | ((low & 0x4000) << 8) | ((low & 0x2000) << 6)
            | (low & 0x1fff);

        CardStatus::from_bits_retain(bits)
    }
}

/// Newtype to decode the R7 response (card interface condition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceCondition(u32);

impl InterfaceCondition {
    /// Decode the response word.
    pub fn new(value: u32) -> Self {
        InterfaceCondition(value)
    }

    /// Check the accepted voltage and the echoed check pattern.
    pub fn check(&self, check_pattern: u8) -> Result<(), ResponseError> {
        const VOLTAGE_ACCEPTED_MASK: u32 = 0b0000_1111 << 8;
        const CHECK_PATTERN_MASK: u32 = 0x0000_00FF;
        ensure!(
            (self.0 & VOLTAGE_ACCEPTED_MASK) >> 8 == VOLTAGE_2_7_TO_3_6.into(),
            UnexpectVoltageSnafu
        );
        ensure!(
            self.0 & CHECK_PATTERN_MASK == check_pattern.into(),
            CheckPatternMismatchSnafu
        );

        Ok(())
    }
}
