// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! PLL descriptor validation and programming.
//!
//! All eight PLLs on this SoC share one control block layout and one set of
//! range restrictions. In integer mode (DSM disabled):
//!
//! ```text
//! FOUTVCO     = FREF / REFDIV * FBDIV
//! FOUTPOSTDIV = FOUTVCO / POSTDIV1 / POSTDIV2
//! ```
//!
//! where FREF is the 24 MHz crystal. A descriptor is computed once from a
//! target output frequency, checked against the VCO and output ranges, and
//! only then written to hardware; rate changes derive a fresh descriptor.

use super::ClockError;
use crate::mmio::{MmioBus, masked_write, poll32};
use log::debug;
use num_enum::IntoPrimitive;

/// Crystal oscillator feeding every PLL.
pub const OSC_HZ: u64 = 24_000_000;

/// VCO frequency range common to all PLLs, in kHz.
pub const VCO_RANGE_KHZ: core::ops::RangeInclusive<u64> = 800_000..=3_200_000;
/// Post-divided output frequency range, in kHz.
pub const OUTPUT_RANGE_KHZ: core::ops::RangeInclusive<u64> = 16_000..=3_200_000;
/// Feedback divider range in integer mode.
pub const FBDIV_RANGE: core::ops::RangeInclusive<u32> = 16..=3200;

// PLL_CON0
const PLL_FBDIV_MASK: u32 = 0xfff;

// PLL_CON1
const PLL_POSTDIV2_SHIFT: u32 = 12;
const PLL_POSTDIV2_MASK: u32 = 0x7 << PLL_POSTDIV2_SHIFT;
const PLL_POSTDIV1_SHIFT: u32 = 8;
const PLL_POSTDIV1_MASK: u32 = 0x7 << PLL_POSTDIV1_SHIFT;
const PLL_REFDIV_MASK: u32 = 0x3f;

// PLL_CON2
const PLL_LOCK_STATUS: u32 = 1 << 31;

// PLL_CON3
const PLL_MODE_SHIFT: u32 = 8;
const PLL_MODE_MASK: u32 = 0x3 << PLL_MODE_SHIFT;
const PLL_DSMPD_SHIFT: u32 = 3;
const PLL_DSMPD_MASK: u32 = 1 << PLL_DSMPD_SHIFT;
const PLL_INTEGER_MODE: u32 = 1;

/// Retry budget for the lock-status poll, in 1 µs steps.
const LOCK_POLL_TRIES: u32 = 100_000;

/// Work mode field of PLL_CON3.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u32)]
pub enum PllMode {
    /// Bypass: the PLL block outputs the 24 MHz reference.
    Slow = 0,
    /// The post-divided PLL output is active.
    Normal = 1,
    /// Deep slow mode (32 kHz source); unused at bring-up.
    Deep = 2,
}

/// One PLL configuration: reference, feedback and post dividers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PllDivisors {
    /// Reference clock divider, 6-bit field.
    pub refdiv: u32,
    /// Feedback divider, 12-bit field.
    pub fbdiv: u32,
    /// First post divider, 1..=7.
    pub postdiv1: u32,
    /// Second post divider, 1..=7.
    pub postdiv2: u32,
    /// Fractional part; always zero here, integer mode only.
    pub frac: u32,
}

impl PllDivisors {
    /// Derives the feedback divider for an output of `hz` given the other
    /// three divisors, the way the fixed frequency plan entries are built:
    /// `fbdiv = hz * refdiv * postdiv1 * postdiv2 / 24 MHz`.
    pub const fn for_output(hz: u64, refdiv: u32, postdiv1: u32, postdiv2: u32) -> Self {
        let fbdiv = hz * refdiv as u64 * postdiv1 as u64 * postdiv2 as u64 / OSC_HZ;
        Self {
            refdiv,
            fbdiv: fbdiv as u32,
            postdiv1,
            postdiv2,
            frac: 0,
        }
    }

    /// VCO frequency this descriptor produces, in kHz.
    pub const fn vco_khz(&self) -> u64 {
        OSC_HZ / 1000 * self.fbdiv as u64 / self.refdiv as u64
    }

    /// Post-divided output frequency, in kHz.
    pub const fn output_khz(&self) -> u64 {
        self.vco_khz() / self.postdiv1 as u64 / self.postdiv2 as u64
    }

    /// Checks the descriptor against the hardware ranges. Called before any
    /// register write; a violation is a frequency-plan bug, never a runtime
    /// condition.
    pub fn validate(&self) -> Result<(), ClockError> {
        if self.refdiv == 0
            || self.refdiv > PLL_REFDIV_MASK
            || self.postdiv1 == 0
            || self.postdiv1 > 7
            || self.postdiv2 == 0
            || self.postdiv2 > 7
        {
            return Err(ClockError::InvalidPllDivisor);
        }
        if !FBDIV_RANGE.contains(&self.fbdiv) {
            return Err(ClockError::FbdivOutOfRange { fbdiv: self.fbdiv });
        }
        let vco_khz = self.vco_khz();
        if !VCO_RANGE_KHZ.contains(&vco_khz) {
            return Err(ClockError::VcoOutOfRange { khz: vco_khz });
        }
        let output_khz = self.output_khz();
        if !OUTPUT_RANGE_KHZ.contains(&output_khz) {
            return Err(ClockError::OutputOutOfRange { khz: output_khz });
        }
        Ok(())
    }
}

/// Programs the PLL control block at byte offset `con` with `div` and waits
/// for lock.
///
/// The sequence is fixed by the silicon: force slow mode so the downstream
/// tree keeps a stable clock while the loop retunes, select integer mode,
/// program the feedback divider, program the reference and post dividers in
/// one write, wait for the lock flag, then switch to normal mode.
pub fn set_pll<B: MmioBus>(bus: &mut B, con: usize, div: &PllDivisors) -> Result<(), ClockError> {
    div.validate()?;

    debug!(
        "PLL at {con:#x}: fbdiv={}, refdiv={}, postdiv1={}, postdiv2={}, vco={} kHz, output={} kHz",
        div.fbdiv,
        div.refdiv,
        div.postdiv1,
        div.postdiv2,
        div.vco_khz(),
        div.output_khz()
    );

    // Changing the loop settings with the output selected would propagate an
    // unstable clock; bypass to the reference first.
    masked_write(
        bus,
        con + 0xc,
        PLL_MODE_MASK,
        u32::from(PllMode::Slow) << PLL_MODE_SHIFT,
    );

    masked_write(
        bus,
        con + 0xc,
        PLL_DSMPD_MASK,
        PLL_INTEGER_MODE << PLL_DSMPD_SHIFT,
    );

    masked_write(bus, con, PLL_FBDIV_MASK, div.fbdiv);
    masked_write(
        bus,
        con + 0x4,
        PLL_POSTDIV2_MASK | PLL_POSTDIV1_MASK | PLL_REFDIV_MASK,
        (div.postdiv2 << PLL_POSTDIV2_SHIFT) | (div.postdiv1 << PLL_POSTDIV1_SHIFT) | div.refdiv,
    );

    poll32(bus, con + 0x8, |v| v & PLL_LOCK_STATUS != 0, LOCK_POLL_TRIES, 1)
        .map_err(|_| ClockError::PllLockTimeout)?;

    masked_write(
        bus,
        con + 0xc,
        PLL_MODE_MASK,
        u32::from(PllMode::Normal) << PLL_MODE_SHIFT,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::fake::HiwordFake;

    /// A PLL block whose lock flag asserts as soon as the dividers are
    /// programmed.
    fn pll_block() -> HiwordFake<0x20> {
        HiwordFake::with_write_hook(|mem, offset| {
            if offset == 0x4 {
                mem[0xb] |= 0x80;
            }
        })
    }

    #[test]
    fn gpll_style_descriptor_in_range() {
        // End-to-end check: 24 MHz * 198 / 2 = 2376 MHz VCO, / 2 / 1 =
        // 1188 MHz output, all within limits.
        let div = PllDivisors {
            refdiv: 2,
            fbdiv: 198,
            postdiv1: 2,
            postdiv2: 1,
            frac: 0,
        };
        assert_eq!(div.vco_khz(), 2_376_000);
        assert_eq!(div.output_khz(), 1_188_000);
        assert_eq!(div.validate(), Ok(()));

        let mut bus = pll_block();
        assert_eq!(set_pll(&mut bus, 0, &div), Ok(()));
        // FBDIV field.
        assert_eq!(bus.peek32(0x0) & 0xfff, 198);
        // REFDIV, POSTDIV1, POSTDIV2 fields in one register.
        assert_eq!(bus.peek32(0x4), (1 << 12) | (2 << 8) | 2);
        // Integer mode selected, normal mode entered.
        assert_eq!(bus.peek32(0xc) & 0x308, (1 << 8) | (1 << 3));
    }

    #[test]
    fn for_output_matches_plan_entries() {
        // The frequency-plan constructor: GPLL at 594 MHz with /2 ref and
        // /2 /1 post dividers needs fbdiv 99.
        let div = PllDivisors::for_output(594_000_000, 2, 2, 1);
        assert_eq!(div.fbdiv, 99);
        assert_eq!(div.output_khz(), 594_000);
        assert_eq!(div.validate(), Ok(()));
    }

    #[test]
    fn out_of_range_descriptors_rejected() {
        let mut div = PllDivisors {
            refdiv: 1,
            fbdiv: 8,
            postdiv1: 1,
            postdiv2: 1,
            frac: 0,
        };
        // fbdiv below the integer-mode minimum.
        assert_eq!(
            div.validate(),
            Err(ClockError::FbdivOutOfRange { fbdiv: 8 })
        );

        // 24 MHz * 20 / 1 = 480 MHz VCO, below the 800 MHz floor.
        div.fbdiv = 20;
        assert_eq!(
            div.validate(),
            Err(ClockError::VcoOutOfRange { khz: 480_000 })
        );

        // Post divider beyond the 3-bit field.
        div.fbdiv = 99;
        div.postdiv1 = 8;
        assert_eq!(div.validate(), Err(ClockError::InvalidPllDivisor));

        // Zero refdiv can never be written.
        div.postdiv1 = 2;
        div.refdiv = 0;
        assert_eq!(div.validate(), Err(ClockError::InvalidPllDivisor));
    }

    #[test]
    fn rejected_descriptor_touches_no_registers() {
        let bad = PllDivisors {
            refdiv: 1,
            fbdiv: 4000,
            postdiv1: 1,
            postdiv2: 1,
            frac: 0,
        };
        let mut bus = pll_block();
        assert!(set_pll(&mut bus, 0, &bad).is_err());
        for con in 0..4 {
            assert_eq!(bus.peek32(con * 4), 0);
        }
    }

    #[test]
    fn programming_is_idempotent() {
        let div = PllDivisors::for_output(594_000_000, 2, 2, 1);
        let mut bus = pll_block();
        set_pll(&mut bus, 0, &div).unwrap();
        let first = (bus.peek32(0), bus.peek32(4), bus.peek32(0xc));
        set_pll(&mut bus, 0, &div).unwrap();
        assert_eq!(first, (bus.peek32(0), bus.peek32(4), bus.peek32(0xc)));
    }

    #[test]
    fn lock_poll_bounded() {
        // A block that never locks must report a timeout, not hang.
        let mut bus = HiwordFake::<0x20>::new();
        let div = PllDivisors::for_output(594_000_000, 2, 2, 1);
        assert_eq!(set_pll(&mut bus, 0, &div), Err(ClockError::PllLockTimeout));
    }
}
