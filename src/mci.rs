// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! MCI core contract: the command/response/data types exchanged between
//! storage enumeration and a host controller driver.
//!
//! A [`Command`] is constructed per call and consumed synchronously; the
//! host fills in a [`Response`] whose shape follows the declared response
//! type. Retry policy lives above this layer: a driver returning
//! [`MciError::Timeout`] or [`MciError::CommunicationLost`] has already
//! reset itself to a clean state, so the caller may simply reissue.

use bitflags::bitflags;
use thiserror::Error;

/// Errors a host controller reports to the MCI core.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum MciError {
    /// The controller would not leave its busy state.
    #[error("controller busy")]
    Busy,
    /// Communication with the card broke down (CRC, index or end-bit
    /// errors, or a busy wait that exhausted its capped backoff).
    #[error("communication error")]
    CommunicationLost,
    /// The card did not answer within the protocol timeout.
    #[error("timeout")]
    Timeout,
    /// A data-phase transfer failed.
    #[error("data I/O error")]
    Io,
    /// The controller or request configuration is unusable.
    #[error("invalid configuration")]
    InvalidConfig,
}

bitflags! {
    /// Properties of a command's expected response.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ResponseType: u32 {
        /// A response is present on the command line.
        const PRESENT = 1 << 0;
        /// The response is 136 bits long rather than 48.
        const LONG = 1 << 1;
        /// The response carries a valid CRC field.
        const CRC = 1 << 2;
        /// The card signals busy on DAT0 after the response.
        const BUSY = 1 << 3;
        /// The response echoes the command index.
        const OPCODE = 1 << 4;
    }
}

impl ResponseType {
    /// No response.
    pub const NONE: Self = Self::empty();
    /// Normal response.
    pub const R1: Self = Self::PRESENT.union(Self::CRC).union(Self::OPCODE);
    /// Normal response with busy signaling.
    pub const R1B: Self = Self::R1.union(Self::BUSY);
    /// 136-bit CID/CSD response.
    pub const R2: Self = Self::PRESENT.union(Self::LONG).union(Self::CRC);
    /// OCR response; no CRC protection.
    pub const R3: Self = Self::PRESENT;
    /// Published-RCA response.
    pub const R6: Self = Self::R1;
    /// Interface-condition response.
    pub const R7: Self = Self::R1;
}

/// Standard command indices used by the boot path.
pub mod cmd {
    /// Reset the card to idle state.
    pub const GO_IDLE_STATE: u8 = 0;
    /// Read the CID of all cards.
    pub const ALL_SEND_CID: u8 = 2;
    /// Assign/ask relative card address.
    pub const SET_RELATIVE_ADDR: u8 = 3;
    /// Select the addressed card.
    pub const SELECT_CARD: u8 = 7;
    /// SD interface condition.
    pub const SEND_IF_COND: u8 = 8;
    /// Read the card-specific data register.
    pub const SEND_CSD: u8 = 9;
    /// End a multiple-block transfer.
    pub const STOP_TRANSMISSION: u8 = 12;
    /// Read the card status register.
    pub const SEND_STATUS: u8 = 13;
    /// Set the block length for following transfers.
    pub const SET_BLOCKLEN: u8 = 16;
    /// Read one block.
    pub const READ_SINGLE_BLOCK: u8 = 17;
    /// Read blocks until stopped.
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    /// Write one block.
    pub const WRITE_SINGLE_BLOCK: u8 = 24;
    /// Write blocks until stopped.
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    /// Prefix for application-specific commands.
    pub const APP_CMD: u8 = 55;
}

/// One SD/MMC command.
#[derive(Clone, Copy, Debug)]
pub struct Command {
    /// Command index, 0..=63.
    pub index: u8,
    /// 32-bit command argument.
    pub argument: u32,
    /// Expected response shape.
    pub response_type: ResponseType,
}

impl Command {
    /// Builds a command.
    pub fn new(index: u8, argument: u32, response_type: ResponseType) -> Self {
        Self {
            index,
            argument,
            response_type,
        }
    }
}

/// A captured command response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Response {
    /// The command had no response.
    None,
    /// 48-bit response: the 32 payload bits.
    Short(u32),
    /// 136-bit response with the CRC byte stripped, most significant word
    /// first.
    Long([u32; 4]),
}

impl Response {
    /// Payload of a short response, if this is one.
    pub fn short(&self) -> Option<u32> {
        match self {
            Self::Short(word) => Some(*word),
            _ => None,
        }
    }
}

/// Direction of a data phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataDirection {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// The buffer side of a data phase.
#[derive(Debug)]
pub enum DataBuffer<'a> {
    /// Receive buffer for a read.
    Read(&'a mut [u8]),
    /// Source data for a write.
    Write(&'a [u8]),
}

/// A data phase attached to a command; transient, consumed by one call.
#[derive(Debug)]
pub struct DataTransfer<'a> {
    /// Block length in bytes, 512 for the boot path.
    pub block_size: u16,
    /// Number of blocks to move.
    pub blocks: u16,
    /// Buffer covering `block_size * blocks` bytes.
    pub buffer: DataBuffer<'a>,
}

impl DataTransfer<'_> {
    /// Transfer direction, from the buffer flavor.
    pub fn direction(&self) -> DataDirection {
        match self.buffer {
            DataBuffer::Read(_) => DataDirection::Read,
            DataBuffer::Write(_) => DataDirection::Write,
        }
    }
}

/// Card bus width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BusWidth {
    /// Single data line.
    One,
    /// Four data lines.
    Four,
    /// Eight data lines (eMMC).
    Eight,
}

/// Bus timing mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Timing {
    /// Default/identification timing.
    Legacy,
    /// MMC high speed (up to 52 MHz).
    MmcHs,
    /// SD high speed.
    SdHs,
    /// SD UHS SDR50.
    UhsSdr50,
    /// SD UHS SDR104.
    UhsSdr104,
    /// SD UHS DDR50.
    UhsDdr50,
    /// eMMC DDR at 52 MHz.
    MmcDdr52,
    /// eMMC HS200.
    MmcHs200,
    /// eMMC HS400.
    MmcHs400,
}

/// Requested bus state, applied by [`MciHost::set_ios`].
#[derive(Clone, Copy, Debug)]
pub struct Ios {
    /// Card clock in Hz; 0 stops the clock.
    pub clock_hz: u32,
    /// Data bus width.
    pub bus_width: BusWidth,
    /// Timing mode.
    pub timing: Timing,
}

bitflags! {
    /// Supply voltage windows (OCR register layout).
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct VoltageRange: u32 {
        /// 1.65–1.95 V.
        const V165_195 = 1 << 7;
        /// 2.9–3.0 V.
        const V29_30 = 1 << 17;
        /// 3.0–3.1 V.
        const V30_31 = 1 << 18;
        /// 3.2–3.3 V.
        const V32_33 = 1 << 20;
        /// 3.3–3.4 V.
        const V33_34 = 1 << 21;
    }
}

bitflags! {
    /// Host capability summary assembled from controller capability
    /// registers.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct HostCaps: u32 {
        /// 4-bit data bus supported.
        const BIT4 = 1 << 0;
        /// 8-bit data bus supported.
        const BIT8 = 1 << 1;
        /// MMC high-speed timing.
        const MMC_HIGHSPEED = 1 << 2;
        /// MMC high-speed at 52 MHz.
        const MMC_HIGHSPEED_52MHZ = 1 << 3;
        /// SD high-speed timing.
        const SD_HIGHSPEED = 1 << 4;
    }
}

/// The contract a host controller driver offers to storage enumeration.
pub trait MciHost {
    /// One-time controller bring-up: reset, power, interrupt routing.
    fn init(&mut self) -> Result<(), MciError>;

    /// Applies clock, bus width and timing.
    fn set_ios(&mut self, ios: &Ios) -> Result<(), MciError>;

    /// Issues one command, with an optional synchronous data phase.
    fn send_command(
        &mut self,
        command: &Command,
        data: Option<&mut DataTransfer<'_>>,
    ) -> Result<Response, MciError>;
}
