// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Block-device adapter over the MCI command contract.
//!
//! Storage enumeration talks 512-byte blocks; this adapter translates block
//! ranges into the READ/WRITE single/multiple command pairs, closing
//! multi-block transfers with STOP_TRANSMISSION. Addresses are sector
//! numbers; high-capacity addressing throughout, since the boot media here
//! is always eMMC larger than 2 GiB.

use crate::mci::{
    Command, DataBuffer, DataTransfer, MciError, MciHost, ResponseType, cmd,
};
use log::debug;
use thiserror::Error;

/// Sector size shared by all boot media here.
pub const SECTOR_SIZE: usize = 512;

/// Block I/O failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum BlockError {
    /// The underlying command failed.
    #[error(transparent)]
    Mci(#[from] MciError),
    /// The request runs past the device capacity.
    #[error("block range outside device")]
    OutOfRange,
    /// The buffer length is not a whole number of sectors.
    #[error("buffer is not sector-sized")]
    BadBuffer,
}

/// Sector-addressed storage exposed to boot-image loading.
pub trait BlockDevice {
    /// Device capacity in sectors.
    fn num_blocks(&self) -> u64;

    /// Reads whole sectors starting at `block` into `buf`.
    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes whole sectors starting at `block` from `buf`.
    fn write_blocks(&mut self, block: u64, buf: &[u8]) -> Result<(), BlockError>;
}

/// [`BlockDevice`] over an [`MciHost`].
pub struct MciBlockDevice<H: MciHost> {
    host: H,
    num_blocks: u64,
    blocklen_set: bool,
}

impl<H: MciHost> MciBlockDevice<H> {
    /// Wraps an initialized, enumerated host exposing `num_blocks` sectors.
    pub fn new(host: H, num_blocks: u64) -> Self {
        Self {
            host,
            num_blocks,
            blocklen_set: false,
        }
    }

    /// The wrapped host, for bus reconfiguration.
    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    fn set_blocklen(&mut self) -> Result<(), MciError> {
        if self.blocklen_set {
            return Ok(());
        }
        self.host.send_command(
            &Command::new(cmd::SET_BLOCKLEN, SECTOR_SIZE as u32, ResponseType::R1),
            None,
        )?;
        self.blocklen_set = true;
        Ok(())
    }

    fn check_range(&self, block: u64, len: usize) -> Result<u16, BlockError> {
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(BlockError::BadBuffer);
        }
        let count = (len / SECTOR_SIZE) as u64;
        if block + count > self.num_blocks {
            return Err(BlockError::OutOfRange);
        }
        Ok(count as u16)
    }

    fn stop_transmission(&mut self) -> Result<(), MciError> {
        self.host
            .send_command(
                &Command::new(cmd::STOP_TRANSMISSION, 0, ResponseType::R1B),
                None,
            )
            .map(|_| ())
    }
}

impl<H: MciHost> BlockDevice for MciBlockDevice<H> {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let count = self.check_range(block, buf.len())?;
        self.set_blocklen()?;
        debug!("block read: {count} sectors at {block}");

        let index = if count > 1 {
            cmd::READ_MULTIPLE_BLOCK
        } else {
            cmd::READ_SINGLE_BLOCK
        };
        let mut data = DataTransfer {
            block_size: SECTOR_SIZE as u16,
            blocks: count,
            buffer: DataBuffer::Read(buf),
        };
        self.host.send_command(
            &Command::new(index, block as u32, ResponseType::R1),
            Some(&mut data),
        )?;
        if count > 1 {
            self.stop_transmission()?;
        }
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, buf: &[u8]) -> Result<(), BlockError> {
        let count = self.check_range(block, buf.len())?;
        self.set_blocklen()?;
        debug!("block write: {count} sectors at {block}");

        let index = if count > 1 {
            cmd::WRITE_MULTIPLE_BLOCK
        } else {
            cmd::WRITE_SINGLE_BLOCK
        };
        let mut data = DataTransfer {
            block_size: SECTOR_SIZE as u16,
            blocks: count,
            buffer: DataBuffer::Write(buf),
        };
        self.host.send_command(
            &Command::new(index, block as u32, ResponseType::R1),
            Some(&mut data),
        )?;
        if count > 1 {
            self.stop_transmission()?;
        }
        Ok(())
    }
}
