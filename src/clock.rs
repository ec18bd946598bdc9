// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RK3399 clock tree bring-up.
//!
//! Runs exactly once at early boot, before any peripheral is touched: first
//! the two CPU-cluster PLLs and their bus dividers, then the general-purpose
//! and codec PLLs, then the three peripheral clock groups. Every bus divider
//! in the fixed frequency plan must divide its parent exactly; a remainder
//! would mean silent bus-timing drift, so it is rejected outright instead of
//! rounded.
//!
//! Register layout (CRU at `0xff76_0000`, PMUCRU at `0xff75_0000`): seven
//! PLL control blocks of four words each at 0x20 strides from the CRU base,
//! `CLKSEL_CON[n]` at `0x100 + 4 * n`; the PMU PLL block at the PMUCRU base
//! with `PMUCRU_CLKSEL_CON[n]` at `0x80 + 4 * n`. All fields are written
//! with the write-enable-masked encoding, so no read-modify-write cycles.

pub mod pll;

use crate::mmio::{MmioBus, masked_write};
use log::debug;
use pll::{PllDivisors, set_pll};
use thiserror::Error;

/// Errors raised by clock configuration and the clock-consumer interface.
///
/// The divider and PLL-range variants are configuration-time contract
/// violations (frequency-plan bugs); callers treat them as fatal at boot.
/// `PllLockTimeout` means the silicon never raised its lock flag within the
/// poll budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ClockError {
    /// A reference or post divider is zero or exceeds its field width.
    #[error("PLL reference/post divider outside its field")]
    InvalidPllDivisor,
    /// The feedback divider is outside the integer-mode range.
    #[error("PLL feedback divider {fbdiv} outside 16..=3200")]
    FbdivOutOfRange {
        /// Offending feedback divider.
        fbdiv: u32,
    },
    /// The VCO frequency falls outside the silicon's range.
    #[error("PLL VCO of {khz} kHz outside 800..3200 MHz")]
    VcoOutOfRange {
        /// Resulting VCO frequency in kHz.
        khz: u64,
    },
    /// The post-divided output falls outside the silicon's range.
    #[error("PLL output of {khz} kHz outside 16..3200 MHz")]
    OutputOutOfRange {
        /// Resulting output frequency in kHz.
        khz: u64,
    },
    /// The PLL never reported lock within the poll budget.
    #[error("PLL failed to lock")]
    PllLockTimeout,
    /// A bus clock does not divide its parent exactly.
    #[error("{target_hz} Hz does not divide parent {parent_hz} Hz exactly")]
    InexactDivider {
        /// Parent clock rate.
        parent_hz: u64,
        /// Requested bus clock rate.
        target_hz: u64,
    },
    /// An exact divider exists but does not fit the register field.
    #[error("divider {div} exceeds field maximum {max}")]
    DividerTooLarge {
        /// Computed divider field value.
        div: u32,
        /// Largest value the field can hold.
        max: u32,
    },
    /// A clock-consumer lookup used a name no clock is registered under.
    #[error("unknown clock")]
    UnknownClock,
    /// The clock-consumer interface was used before the tree was set up.
    #[error("clock tree not initialized")]
    NotInitialized,
}

const KHZ: u64 = 1000;
const MHZ: u64 = 1_000_000;

/// CPU cluster L PLL target.
pub const LPLL_HZ: u64 = 600 * MHZ;
/// CPU cluster B PLL target.
pub const BPLL_HZ: u64 = 600 * MHZ;
/// General-purpose PLL target; parent of the peripheral groups and eMMC.
pub const GPLL_HZ: u64 = 594 * MHZ;
/// Codec PLL target.
pub const CPLL_HZ: u64 = 384 * MHZ;
/// PMU PLL target.
pub const PPLL_HZ: u64 = 676 * MHZ;

/// PMU bus clock.
pub const PMU_PCLK_HZ: u64 = 48 * MHZ;

const ACLKM_CORE_HZ: u64 = 300 * MHZ;
const ATCLK_CORE_HZ: u64 = 300 * MHZ;
const PCLK_DBG_HZ: u64 = 100 * MHZ;

const PERIHP_ACLK_HZ: u64 = 148_500 * KHZ;
const PERIHP_HCLK_HZ: u64 = 148_500 * KHZ;
const PERIHP_PCLK_HZ: u64 = 37_125 * KHZ;

const PERILP0_ACLK_HZ: u64 = 99_000 * KHZ;
const PERILP0_HCLK_HZ: u64 = 99_000 * KHZ;
const PERILP0_PCLK_HZ: u64 = 49_500 * KHZ;

const PERILP1_HCLK_HZ: u64 = 99_000 * KHZ;
const PERILP1_PCLK_HZ: u64 = 49_500 * KHZ;

// PLL control block offsets from the CRU base.
const APLL_L_CON: usize = 0x00;
const APLL_B_CON: usize = 0x20;
/// CPLL control block offset.
pub const CPLL_CON: usize = 0x60;
/// GPLL control block offset.
pub const GPLL_CON: usize = 0x80;
/// PPLL control block offset from the PMUCRU base.
pub const PPLL_CON: usize = 0x00;

/// Byte offset of `CLKSEL_CON[n]`.
pub const fn clksel_con(n: usize) -> usize {
    0x100 + 4 * n
}

/// Byte offset of `PMUCRU_CLKSEL_CON[n]`.
pub const fn pmucru_clksel_con(n: usize) -> usize {
    0x80 + 4 * n
}

// CLKSEL_CON0 / CLKSEL_CON2 (clusters L and B share a layout).
const ACLKM_CORE_DIV_SHIFT: u32 = 8;
const ACLKM_CORE_DIV_MASK: u32 = 0x1f << ACLKM_CORE_DIV_SHIFT;
const CLK_CORE_PLL_SEL_SHIFT: u32 = 6;
const CLK_CORE_PLL_SEL_MASK: u32 = 0x3 << CLK_CORE_PLL_SEL_SHIFT;
const CLK_CORE_PLL_SEL_ALPLL: u32 = 0x0;
const CLK_CORE_PLL_SEL_ABPLL: u32 = 0x1;
const CLK_CORE_DIV_MASK: u32 = 0x1f;

// CLKSEL_CON1 / CLKSEL_CON3.
const PCLK_DBG_DIV_SHIFT: u32 = 8;
const PCLK_DBG_DIV_MASK: u32 = 0x1f << PCLK_DBG_DIV_SHIFT;
const ATCLK_CORE_DIV_SHIFT: u32 = 0;
const ATCLK_CORE_DIV_MASK: u32 = 0x1f;

// CLKSEL_CON14.
const PCLK_PERIHP_DIV_SHIFT: u32 = 12;
const PCLK_PERIHP_DIV_MASK: u32 = 0x7 << PCLK_PERIHP_DIV_SHIFT;
const HCLK_PERIHP_DIV_SHIFT: u32 = 8;
const HCLK_PERIHP_DIV_MASK: u32 = 0x3 << HCLK_PERIHP_DIV_SHIFT;
const ACLK_PERIHP_PLL_SEL_SHIFT: u32 = 7;
const ACLK_PERIHP_PLL_SEL_MASK: u32 = 1 << ACLK_PERIHP_PLL_SEL_SHIFT;
const ACLK_PERIHP_PLL_SEL_GPLL: u32 = 1;
const ACLK_PERIHP_DIV_MASK: u32 = 0x1f;

// CLKSEL_CON23.
const PCLK_PERILP0_DIV_SHIFT: u32 = 12;
const PCLK_PERILP0_DIV_MASK: u32 = 0x7 << PCLK_PERILP0_DIV_SHIFT;
const HCLK_PERILP0_DIV_SHIFT: u32 = 8;
const HCLK_PERILP0_DIV_MASK: u32 = 0x3 << HCLK_PERILP0_DIV_SHIFT;
const ACLK_PERILP0_PLL_SEL_SHIFT: u32 = 7;
const ACLK_PERILP0_PLL_SEL_MASK: u32 = 1 << ACLK_PERILP0_PLL_SEL_SHIFT;
const ACLK_PERILP0_PLL_SEL_GPLL: u32 = 1;
const ACLK_PERILP0_DIV_MASK: u32 = 0x1f;

// CLKSEL_CON25.
const PCLK_PERILP1_DIV_SHIFT: u32 = 8;
const PCLK_PERILP1_DIV_MASK: u32 = 0x7 << PCLK_PERILP1_DIV_SHIFT;
const HCLK_PERILP1_PLL_SEL_SHIFT: u32 = 7;
const HCLK_PERILP1_PLL_SEL_MASK: u32 = 1 << HCLK_PERILP1_PLL_SEL_SHIFT;
const HCLK_PERILP1_PLL_SEL_GPLL: u32 = 1;
const HCLK_PERILP1_DIV_SHIFT: u32 = 0;
const HCLK_PERILP1_DIV_MASK: u32 = 0x1f;

// PMUCRU_CLKSEL_CON0.
const PMU_PCLK_DIV_CON_MASK: u32 = 0x1f;

/// Frequency-plan PLL descriptors.
const GPLL_INIT_CFG: PllDivisors = PllDivisors::for_output(GPLL_HZ, 2, 2, 1);
const CPLL_INIT_CFG: PllDivisors = PllDivisors::for_output(CPLL_HZ, 1, 2, 2);
const PPLL_INIT_CFG: PllDivisors = PllDivisors::for_output(PPLL_HZ, 2, 2, 1);

const APLL_L_1600_CFG: PllDivisors = PllDivisors::for_output(1600 * MHZ, 3, 1, 1);
const APLL_L_600_CFG: PllDivisors = PllDivisors::for_output(600 * MHZ, 1, 2, 1);
const APLL_B_600_CFG: PllDivisors = PllDivisors::for_output(600 * MHZ, 1, 2, 1);

/// Selectable cluster-L PLL rates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApllLFrequency {
    /// 1.6 GHz operating point.
    F1600Mhz,
    /// 600 MHz bring-up point.
    F600Mhz,
}

impl ApllLFrequency {
    const fn config(self) -> &'static PllDivisors {
        match self {
            Self::F1600Mhz => &APLL_L_1600_CFG,
            Self::F600Mhz => &APLL_L_600_CFG,
        }
    }
}

/// Computes the `div` field such that `(div + 1) * target_hz == parent_hz`
/// exactly, rejecting inexact ratios and fields wider than `max`.
pub fn exact_div(parent_hz: u64, target_hz: u64, max: u32) -> Result<u32, ClockError> {
    if target_hz == 0 || target_hz > parent_hz {
        return Err(ClockError::InexactDivider {
            parent_hz,
            target_hz,
        });
    }
    let div = (parent_hz / target_hz) as u32 - 1;
    if (div as u64 + 1) * target_hz != parent_hz {
        return Err(ClockError::InexactDivider {
            parent_hz,
            target_hz,
        });
    }
    if div > max {
        return Err(ClockError::DividerTooLarge { div, max });
    }
    Ok(div)
}

/// Brings up cluster L: APLL_L plus the `aclkm`, `pclk_dbg` and `atclk`
/// dividers, written together with the PLL-select field.
pub fn configure_cpu_l<B: MmioBus>(cru: &mut B, freq: ApllLFrequency) -> Result<(), ClockError> {
    set_pll(cru, APLL_L_CON, freq.config())?;

    let aclkm_div = exact_div(LPLL_HZ, ACLKM_CORE_HZ, 0x1f)?;
    let pclk_dbg_div = exact_div(LPLL_HZ, PCLK_DBG_HZ, 0x1f)?;
    let atclk_div = exact_div(LPLL_HZ, ATCLK_CORE_HZ, 0x1f)?;

    masked_write(
        cru,
        clksel_con(0),
        ACLKM_CORE_DIV_MASK | CLK_CORE_PLL_SEL_MASK | CLK_CORE_DIV_MASK,
        (aclkm_div << ACLKM_CORE_DIV_SHIFT)
            | (CLK_CORE_PLL_SEL_ALPLL << CLK_CORE_PLL_SEL_SHIFT),
    );
    masked_write(
        cru,
        clksel_con(1),
        PCLK_DBG_DIV_MASK | ATCLK_CORE_DIV_MASK,
        (pclk_dbg_div << PCLK_DBG_DIV_SHIFT) | (atclk_div << ATCLK_CORE_DIV_SHIFT),
    );
    Ok(())
}

/// Brings up cluster B; same shape as cluster L two registers further up.
pub fn configure_cpu_b<B: MmioBus>(cru: &mut B) -> Result<(), ClockError> {
    set_pll(cru, APLL_B_CON, &APLL_B_600_CFG)?;

    let aclkm_div = exact_div(BPLL_HZ, ACLKM_CORE_HZ, 0x1f)?;
    let pclk_dbg_div = exact_div(BPLL_HZ, PCLK_DBG_HZ, 0x1f)?;
    let atclk_div = exact_div(BPLL_HZ, ATCLK_CORE_HZ, 0x1f)?;

    masked_write(
        cru,
        clksel_con(2),
        ACLKM_CORE_DIV_MASK | CLK_CORE_PLL_SEL_MASK | CLK_CORE_DIV_MASK,
        (aclkm_div << ACLKM_CORE_DIV_SHIFT)
            | (CLK_CORE_PLL_SEL_ABPLL << CLK_CORE_PLL_SEL_SHIFT),
    );
    masked_write(
        cru,
        clksel_con(3),
        PCLK_DBG_DIV_MASK | ATCLK_CORE_DIV_MASK,
        (pclk_dbg_div << PCLK_DBG_DIV_SHIFT) | (atclk_div << ATCLK_CORE_DIV_SHIFT),
    );
    Ok(())
}

/// Main CRU bring-up: cluster PLLs, boot ROM cleanup, GPLL/CPLL and the
/// three peripheral clock groups.
pub fn rkclk_init<B: MmioBus>(cru: &mut B) -> Result<(), ClockError> {
    configure_cpu_l(cru, ApllLFrequency::F600Mhz)?;
    configure_cpu_b(cru)?;

    // The boot ROM leaves a few mux/divider registers differing from their
    // documented power-on defaults; restore them so the kernel's view of the
    // tree matches the datasheet.
    masked_write(cru, clksel_con(12), 0xffff, 0x4101);
    masked_write(cru, clksel_con(19), 0xffff, 0x033f);
    masked_write(cru, clksel_con(56), 0x0003, 0x0003);

    set_pll(cru, GPLL_CON, &GPLL_INIT_CFG)?;
    set_pll(cru, CPLL_CON, &CPLL_INIT_CFG)?;

    // High-speed peripheral group: aclk, hclk, pclk from GPLL.
    let aclk_div = exact_div(GPLL_HZ, PERIHP_ACLK_HZ, 0x1f)?;
    let hclk_div = exact_div(PERIHP_ACLK_HZ, PERIHP_HCLK_HZ, 0x3)?;
    let pclk_div = exact_div(PERIHP_ACLK_HZ, PERIHP_PCLK_HZ, 0x7)?;
    masked_write(
        cru,
        clksel_con(14),
        PCLK_PERIHP_DIV_MASK
            | HCLK_PERIHP_DIV_MASK
            | ACLK_PERIHP_PLL_SEL_MASK
            | ACLK_PERIHP_DIV_MASK,
        (pclk_div << PCLK_PERIHP_DIV_SHIFT)
            | (hclk_div << HCLK_PERIHP_DIV_SHIFT)
            | (ACLK_PERIHP_PLL_SEL_GPLL << ACLK_PERIHP_PLL_SEL_SHIFT)
            | aclk_div,
    );

    // Low-power peripheral group 0.
    let aclk_div = exact_div(GPLL_HZ, PERILP0_ACLK_HZ, 0x1f)?;
    let hclk_div = exact_div(PERILP0_ACLK_HZ, PERILP0_HCLK_HZ, 0x3)?;
    let pclk_div = exact_div(PERILP0_ACLK_HZ, PERILP0_PCLK_HZ, 0x7)?;
    masked_write(
        cru,
        clksel_con(23),
        PCLK_PERILP0_DIV_MASK
            | HCLK_PERILP0_DIV_MASK
            | ACLK_PERILP0_PLL_SEL_MASK
            | ACLK_PERILP0_DIV_MASK,
        (pclk_div << PCLK_PERILP0_DIV_SHIFT)
            | (hclk_div << HCLK_PERILP0_DIV_SHIFT)
            | (ACLK_PERILP0_PLL_SEL_GPLL << ACLK_PERILP0_PLL_SEL_SHIFT)
            | aclk_div,
    );

    // Low-power peripheral group 1 has no aclk; hclk comes straight off GPLL.
    let hclk_div = exact_div(GPLL_HZ, PERILP1_HCLK_HZ, 0x1f)?;
    let pclk_div = exact_div(PERILP1_HCLK_HZ, PERILP1_PCLK_HZ, 0x7)?;
    masked_write(
        cru,
        clksel_con(25),
        PCLK_PERILP1_DIV_MASK | HCLK_PERILP1_DIV_MASK | HCLK_PERILP1_PLL_SEL_MASK,
        (pclk_div << PCLK_PERILP1_DIV_SHIFT)
            | (hclk_div << HCLK_PERILP1_DIV_SHIFT)
            | (HCLK_PERILP1_PLL_SEL_GPLL << HCLK_PERILP1_PLL_SEL_SHIFT),
    );

    debug!("CRU clock tree configured");
    Ok(())
}

/// PMU-domain bring-up: PPLL and the PMU bus clock divider.
///
/// The PMU pclk divider is the one rounded division in the plan: the PLL
/// lands at 672 MHz (integer feedback divider), and 672 / 14 gives the
/// 48 MHz PMU bus exactly.
pub fn pmuclk_init<B: MmioBus>(pmucru: &mut B) -> Result<(), ClockError> {
    set_pll(pmucru, PPLL_CON, &PPLL_INIT_CFG)?;

    let pclk_div = (PPLL_HZ / PMU_PCLK_HZ) as u32 - 1;
    masked_write(
        pmucru,
        pmucru_clksel_con(0),
        PMU_PCLK_DIV_CON_MASK,
        pclk_div,
    );
    Ok(())
}

/// Full clock bring-up, main CRU first, then the PMU domain.
pub fn clock_init<B: MmioBus>(cru: &mut B, pmucru: &mut B) -> Result<(), ClockError> {
    rkclk_init(cru)?;
    pmuclk_init(pmucru)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::fake::HiwordFake;

    /// CRU-sized register file that asserts each PLL's lock bit once its
    /// divider register (`con + 0x4`) is written.
    fn cru() -> HiwordFake<0x600> {
        HiwordFake::with_write_hook(|mem, offset| {
            if offset < 0xe0 && offset & 0x1f == 0x4 {
                mem[(offset & !0x1f) + 0xb] |= 0x80;
            }
        })
    }

    #[test]
    fn exact_division_accepted_and_inexact_rejected() {
        // 594 MHz / 4 = 148.5 MHz: divider field 3.
        assert_eq!(exact_div(GPLL_HZ, 148_500_000, 0x1f), Ok(3));
        // 150 MHz does not divide 594 MHz.
        assert_eq!(
            exact_div(GPLL_HZ, 150_000_000, 0x1f),
            Err(ClockError::InexactDivider {
                parent_hz: GPLL_HZ,
                target_hz: 150_000_000,
            })
        );
    }

    #[test]
    fn exact_division_respects_field_width() {
        assert_eq!(
            exact_div(594_000_000, 18_562_500, 0x7),
            Err(ClockError::DividerTooLarge { div: 31, max: 7 })
        );
    }

    #[test]
    fn whole_frequency_plan_divides_exactly() {
        // Every fixed-plan divider must divide its parent without remainder
        // and fit its field.
        let plan: &[(u64, u64, u32)] = &[
            (LPLL_HZ, ACLKM_CORE_HZ, 0x1f),
            (LPLL_HZ, PCLK_DBG_HZ, 0x1f),
            (LPLL_HZ, ATCLK_CORE_HZ, 0x1f),
            (BPLL_HZ, ACLKM_CORE_HZ, 0x1f),
            (BPLL_HZ, PCLK_DBG_HZ, 0x1f),
            (BPLL_HZ, ATCLK_CORE_HZ, 0x1f),
            (GPLL_HZ, PERIHP_ACLK_HZ, 0x1f),
            (PERIHP_ACLK_HZ, PERIHP_HCLK_HZ, 0x3),
            (PERIHP_ACLK_HZ, PERIHP_PCLK_HZ, 0x7),
            (GPLL_HZ, PERILP0_ACLK_HZ, 0x1f),
            (PERILP0_ACLK_HZ, PERILP0_HCLK_HZ, 0x3),
            (PERILP0_ACLK_HZ, PERILP0_PCLK_HZ, 0x7),
            (GPLL_HZ, PERILP1_HCLK_HZ, 0x1f),
            (PERILP1_HCLK_HZ, PERILP1_PCLK_HZ, 0x7),
        ];
        for &(parent, target, max) in plan {
            let div = exact_div(parent, target, max).unwrap();
            assert_eq!((div as u64 + 1) * target, parent);
        }
    }

    #[test]
    fn plan_pll_descriptors_validate() {
        for cfg in [
            &GPLL_INIT_CFG,
            &CPLL_INIT_CFG,
            &PPLL_INIT_CFG,
            &APLL_L_1600_CFG,
            &APLL_L_600_CFG,
            &APLL_B_600_CFG,
        ] {
            assert_eq!(cfg.validate(), Ok(()));
        }
    }

    #[test]
    fn cru_init_programs_expected_fields() {
        let mut bus = cru();
        rkclk_init(&mut bus).unwrap();

        // Cluster dividers: 600/300 and 600/100.
        assert_eq!(bus.peek32(clksel_con(0)), 1 << 8);
        assert_eq!(bus.peek32(clksel_con(1)), (5 << 8) | 1);
        assert_eq!(bus.peek32(clksel_con(2)), (1 << 8) | (1 << 6));
        assert_eq!(bus.peek32(clksel_con(3)), (5 << 8) | 1);

        // Boot ROM cleanup values.
        assert_eq!(bus.peek32(clksel_con(12)), 0x4101);
        assert_eq!(bus.peek32(clksel_con(19)), 0x033f);
        assert_eq!(bus.peek32(clksel_con(56)), 0x0003);

        // GPLL fbdiv 99, CPLL fbdiv 64.
        assert_eq!(bus.peek32(GPLL_CON) & 0xfff, 99);
        assert_eq!(bus.peek32(CPLL_CON) & 0xfff, 64);

        // Peripheral groups, one combined write each.
        assert_eq!(bus.peek32(clksel_con(14)), (3 << 12) | (1 << 7) | 3);
        assert_eq!(bus.peek32(clksel_con(23)), (1 << 12) | (1 << 7) | 5);
        assert_eq!(bus.peek32(clksel_con(25)), (1 << 8) | (1 << 7) | 5);
    }

    #[test]
    fn pmu_init_programs_ppll_and_pclk() {
        let mut bus = cru();
        pmuclk_init(&mut bus).unwrap();
        // PPLL integer feedback divider truncates to 112 (672 MHz).
        assert_eq!(bus.peek32(PPLL_CON) & 0xfff, 112);
        // 672 MHz / 14 = 48 MHz.
        assert_eq!(bus.peek32(pmucru_clksel_con(0)), 13);
    }
}
