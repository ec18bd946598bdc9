// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! A simulated register file for unit tests and the sandbox.
//!
//! `FakeMmio` is plain backing memory with an optional write hook, enough to
//! model blocks whose "hardware" behavior is a function of the last write
//! (a PLL asserting its lock bit, a reset bit self-clearing). Controllers
//! with richer behavior (the SDHCI model in the sandbox) implement
//! [`MmioBus`](super::MmioBus) directly instead.

use super::MmioBus;

/// A hook invoked after every write, given the whole register file and the
/// byte offset written. Plain function pointer: the modeled behavior keeps
/// its state in the register file itself.
pub type WriteHook<const SIZE: usize> = fn(&mut [u8; SIZE], usize);

/// A `SIZE`-byte little-endian register file.
pub struct FakeMmio<const SIZE: usize> {
    mem: [u8; SIZE],
    write_hook: Option<WriteHook<SIZE>>,
}

impl<const SIZE: usize> FakeMmio<SIZE> {
    /// Creates a zeroed register file.
    pub const fn new() -> Self {
        Self {
            mem: [0; SIZE],
            write_hook: None,
        }
    }

    /// Creates a zeroed register file whose `hook` runs after every write.
    pub const fn with_write_hook(hook: WriteHook<SIZE>) -> Self {
        Self {
            mem: [0; SIZE],
            write_hook: Some(hook),
        }
    }

    /// Reads a word without going through the bus (no hook, no side effect).
    pub fn peek32(&self, offset: usize) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.mem[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Backdoor-writes a word, bypassing the write hook. Used by tests to
    /// plant hardware-owned state such as status bits.
    pub fn poke32(&mut self, offset: usize, value: u32) {
        self.mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn wrote(&mut self, offset: usize) {
        if let Some(hook) = self.write_hook {
            hook(&mut self.mem, offset);
        }
    }
}

impl<const SIZE: usize> Default for FakeMmio<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// A register file with write-enable-masked semantics, as implemented by
/// the CRU, PMUCRU and GRF blocks: on a 32-bit write, only the low-half bits
/// whose counterpart in the high half is set take effect, and registers read
/// back with the high half clear. A write hook models hardware-owned bits
/// (a PLL lock flag) by poking the file after each masked update.
pub struct HiwordFake<const SIZE: usize> {
    file: FakeMmio<SIZE>,
}

impl<const SIZE: usize> HiwordFake<SIZE> {
    /// Creates a zeroed register file.
    pub const fn new() -> Self {
        Self {
            file: FakeMmio::new(),
        }
    }

    /// Creates a zeroed register file whose `hook` runs after every write.
    pub const fn with_write_hook(hook: WriteHook<SIZE>) -> Self {
        Self {
            file: FakeMmio::with_write_hook(hook),
        }
    }

    /// Reads a word without side effects.
    pub fn peek32(&self, offset: usize) -> u32 {
        self.file.peek32(offset)
    }

    /// Backdoor-writes a word, bypassing write-enable masking and the hook.
    pub fn poke32(&mut self, offset: usize, value: u32) {
        self.file.poke32(offset, value);
    }
}

impl<const SIZE: usize> Default for HiwordFake<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> MmioBus for HiwordFake<SIZE> {
    fn read32(&mut self, offset: usize) -> u32 {
        self.file.read32(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        let enable = value >> 16;
        let old = self.file.peek32(offset);
        let new = (old & !enable) | (value & 0xffff & enable);
        self.file.poke32(offset, new);
        self.file.wrote(offset);
    }

    fn read16(&mut self, offset: usize) -> u16 {
        self.file.read16(offset)
    }

    fn write16(&mut self, offset: usize, value: u16) {
        // Halfword access is not meaningful on these blocks; forward as-is.
        self.file.write16(offset, value);
    }

    fn read8(&mut self, offset: usize) -> u8 {
        self.file.read8(offset)
    }

    fn write8(&mut self, offset: usize, value: u8) {
        self.file.write8(offset, value);
    }
}

impl<const SIZE: usize> MmioBus for FakeMmio<SIZE> {
    fn read32(&mut self, offset: usize) -> u32 {
        self.peek32(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.mem[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.wrote(offset);
    }

    fn read16(&mut self, offset: usize) -> u16 {
        let mut bytes = [0; 2];
        bytes.copy_from_slice(&self.mem[offset..offset + 2]);
        u16::from_le_bytes(bytes)
    }

    fn write16(&mut self, offset: usize, value: u16) {
        self.mem[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self.wrote(offset);
    }

    fn read8(&mut self, offset: usize) -> u8 {
        self.mem[offset]
    }

    fn write8(&mut self, offset: usize, value: u8) {
        self.mem[offset] = value;
        self.wrote(offset);
    }
}
