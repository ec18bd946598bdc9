// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Simulated RK3399 hardware.
//!
//! Register-level models of the blocks the boot path touches: CRU/PMUCRU
//! with self-locking PLLs, the GRF with a self-calibrating eMMC PHY, and an
//! SDHCI controller fronting an in-memory eMMC image. The drivers in the
//! core crate run against these unmodified; the models advance their state
//! on register access, standing in for hardware time.

use rockboot::mmio::MmioBus;
use rockboot::mmio::fake::HiwordFake;
use rockboot::regmap::MmioRegmap;
use rockboot::rk3399::{GRF_SIZE, PMUSGRF_SIZE};
use rockboot::sdhci::regs::{
    ARGUMENT, BLOCK_COUNT, BLOCK_SIZE, BUFFER, CAPABILITIES, CAPABILITIES_1, CAN_DO_8BIT,
    CAN_DO_HISPD, CAN_VDD_330, CLOCK_BASE_SHIFT, CLOCK_CONTROL, CLOCK_INT_EN, CLOCK_INT_STABLE,
    COMMAND, HOST_VERSION, INT_STATUS, IntStatus, PRESENT_STATE, PresentState, RESPONSE,
    SOFTWARE_RESET, SPEC_300,
};
use std::collections::HashMap;

/// CRU-shaped register file: PLLs lock as soon as their dividers are
/// programmed.
pub type CruModel = HiwordFake<0x600>;

/// Builds a CRU (or PMUCRU) model.
pub fn cru_model() -> CruModel {
    HiwordFake::with_write_hook(|mem, offset| {
        if offset < 0xe0 && offset & 0x1f == 0x4 {
            mem[(offset & !0x1f) + 0xb] |= 0x80;
        }
    })
}

const EMMCPHY_CON6: usize = 0xf798;
const EMMCPHY_STATUS: usize = 0xf7a0;

/// GRF window whose eMMC PHY reports CALDONE and DLLRDY when calibration
/// and DLL are enabled.
pub fn grf_model() -> MmioRegmap<HiwordFake<0x1_0000>> {
    MmioRegmap::new(
        HiwordFake::with_write_hook(|mem, offset| {
            if offset == EMMCPHY_CON6 {
                let con6 = mem[EMMCPHY_CON6];
                if con6 & 0x1 != 0 {
                    mem[EMMCPHY_STATUS] |= 1 << 6;
                }
                if con6 & 0x2 != 0 {
                    mem[EMMCPHY_STATUS] |= 1 << 5;
                }
            }
        }),
        GRF_SIZE,
    )
}

/// PMUSGRF window; plain write-enable-masked storage.
pub fn pmusgrf_model() -> MmioRegmap<HiwordFake<0x1_0000>> {
    MmioRegmap::new(HiwordFake::new(), PMUSGRF_SIZE)
}

/// An injected data-phase fault.
#[derive(Clone, Copy, Debug)]
pub struct Fault {
    /// Raise the error after this many bytes have been served.
    pub after_bytes: usize,
    /// Error interrupt bits to raise (the summary bit is added).
    pub bits: u32,
}

/// SDHCI controller model fronting an in-memory eMMC image.
///
/// Decodes the command register writes the way the silicon would: data
/// commands load the PIO FIFO from the image at the sector in the argument
/// register, using the programmed block size and count.
pub struct EmmcController {
    image: Vec<u8>,
    int_status: u32,
    clock_control: u16,
    block_size: u16,
    block_count: u16,
    argument: u32,
    response: [u8; 16],
    read_fifo: Vec<u8>,
    read_pos: usize,
    fault: Option<Fault>,
    /// Software resets observed, in order.
    pub resets: Vec<u8>,
    regs8: HashMap<usize, u8>,
    regs16: HashMap<usize, u16>,
    regs32: HashMap<usize, u32>,
}

mod mmc_cmd {
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
}

impl EmmcController {
    /// A controller serving `image` as card contents.
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            int_status: 0,
            clock_control: 0,
            block_size: 0,
            block_count: 0,
            argument: 0,
            response: [0; 16],
            read_fifo: Vec::new(),
            read_pos: 0,
            fault: None,
            resets: Vec::new(),
            regs8: HashMap::new(),
            regs16: HashMap::new(),
            regs32: HashMap::new(),
        }
    }

    /// Schedules a data-phase fault.
    pub fn inject_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    fn handle_command(&mut self, value: u16) {
        let index = ((value >> 8) & 0x3f) as u8;
        match index {
            mmc_cmd::SET_BLOCKLEN => {}
            mmc_cmd::READ_SINGLE_BLOCK | mmc_cmd::READ_MULTIPLE_BLOCK => {
                let start = self.argument as usize * 512;
                let len = self.block_size as usize * self.block_count as usize;
                self.read_fifo = (start..start + len)
                    .map(|i| self.image.get(i).copied().unwrap_or(0))
                    .collect();
                self.read_pos = 0;
            }
            _ => {}
        }
        self.int_status |= IntStatus::CMD_COMPLETE.bits();
        // Busy-signaling responses raise transfer-complete as well.
        if value & 0x3 == 0x3 {
            self.int_status |= IntStatus::XFER_COMPLETE.bits();
        }
    }

    fn dynamic_status(&self) -> u32 {
        let mut stat = self.int_status;
        if let Some(fault) = self.fault
            && self.read_pos >= fault.after_bytes
            && !self.read_fifo.is_empty()
        {
            return stat | IntStatus::ERROR.bits() | fault.bits;
        }
        if !self.read_fifo.is_empty() {
            if self.read_pos < self.read_fifo.len() {
                stat |= IntStatus::DATA_AVAIL.bits();
            } else {
                stat |= IntStatus::XFER_COMPLETE.bits();
            }
        }
        stat
    }
}

impl MmioBus for EmmcController {
    fn read32(&mut self, offset: usize) -> u32 {
        match offset {
            PRESENT_STATE => {
                let mut state = PresentState::CARD_PRESENT.bits();
                if self.read_pos < self.read_fifo.len() {
                    state |= PresentState::DATA_AVAILABLE.bits();
                }
                state
            }
            INT_STATUS => self.dynamic_status(),
            BUFFER => {
                let mut bytes = [0u8; 4];
                if self.read_pos + 4 <= self.read_fifo.len() {
                    bytes.copy_from_slice(&self.read_fifo[self.read_pos..self.read_pos + 4]);
                    self.read_pos += 4;
                }
                u32::from_le_bytes(bytes)
            }
            RESPONSE..=0x1f => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&self.response[offset - RESPONSE..offset - RESPONSE + 4]);
                u32::from_le_bytes(bytes)
            }
            CAPABILITIES => {
                (200 << CLOCK_BASE_SHIFT) | CAN_VDD_330 | CAN_DO_HISPD | CAN_DO_8BIT
            }
            CAPABILITIES_1 => 0,
            _ => *self.regs32.get(&offset).unwrap_or(&0),
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        match offset {
            INT_STATUS => self.int_status &= !value,
            ARGUMENT => self.argument = value,
            _ => {
                self.regs32.insert(offset, value);
            }
        }
    }

    fn read16(&mut self, offset: usize) -> u16 {
        match offset {
            HOST_VERSION => SPEC_300,
            CLOCK_CONTROL => self.clock_control,
            _ => *self.regs16.get(&offset).unwrap_or(&0),
        }
    }

    fn write16(&mut self, offset: usize, value: u16) {
        match offset {
            CLOCK_CONTROL => {
                self.clock_control = value;
                if value & CLOCK_INT_EN != 0 {
                    self.clock_control |= CLOCK_INT_STABLE;
                }
            }
            BLOCK_SIZE => self.block_size = value & 0xfff,
            BLOCK_COUNT => self.block_count = value,
            COMMAND => self.handle_command(value),
            _ => {
                self.regs16.insert(offset, value);
            }
        }
    }

    fn read8(&mut self, offset: usize) -> u8 {
        match offset {
            SOFTWARE_RESET => 0,
            _ if (RESPONSE..RESPONSE + 16).contains(&offset) => self.response[offset - RESPONSE],
            _ => *self.regs8.get(&offset).unwrap_or(&0),
        }
    }

    fn write8(&mut self, offset: usize, value: u8) {
        match offset {
            SOFTWARE_RESET => {
                self.resets.push(value);
                // A reset aborts any in-flight transfer.
                self.read_fifo.clear();
                self.read_pos = 0;
                self.fault = None;
            }
            _ => {
                self.regs8.insert(offset, value);
            }
        }
    }
}
