// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Clock-consumer interface.
//!
//! Peripheral drivers look clocks up by name and query or request rates
//! through lightweight [`Clk`] handles; the SoC clock provider registered at
//! boot services the requests. Most rates in this bootloader are fixed by
//! the frequency plan, so the provider answers them from constants; the eMMC
//! leaf clock is the one runtime-adjustable rate, programmed through
//! `CLKSEL_CON22`.
//!
//! Clock gates are deliberately left in their boot ROM state: every gate the
//! boot path needs is already open, so `enable`/`disable` only account for
//! the request.

use crate::clock::{
    CPLL_HZ, ClockError, GPLL_HZ, PMU_PCLK_HZ, clksel_con, exact_div,
};
use crate::clock::pll::OSC_HZ;
use crate::mmio::{MmioBus, masked_write};
use log::debug;
use spin::Once;
use spin::mutex::SpinMutex;

/// Clocks exposed to consumers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockId {
    /// General-purpose PLL output.
    Gpll,
    /// Codec PLL output.
    Cpll,
    /// PMU PLL output.
    Ppll,
    /// High-speed peripheral group AXI clock.
    AclkPerihp,
    /// High-speed peripheral group AHB clock.
    HclkPerihp,
    /// High-speed peripheral group APB clock.
    PclkPerihp,
    /// Low-power group 0 AXI clock.
    AclkPerilp0,
    /// Low-power group 0 AHB clock.
    HclkPerilp0,
    /// Low-power group 0 APB clock.
    PclkPerilp0,
    /// Low-power group 1 AHB clock.
    HclkPerilp1,
    /// Low-power group 1 APB clock.
    PclkPerilp1,
    /// eMMC controller AXI clock.
    AclkEmmc,
    /// eMMC card clock generator (controller input clock).
    Emmc,
    /// PMU bus clock.
    PclkPmu,
}

/// Operations the SoC clock driver provides to consumers.
pub trait ClockOps: Send {
    /// Current rate of `id` in Hz.
    fn get_rate(&mut self, id: ClockId) -> Result<u64, ClockError>;
    /// Requests `hz` for `id`; returns the rate actually achieved.
    fn set_rate(&mut self, id: ClockId, hz: u64) -> Result<u64, ClockError>;
    /// Ungates `id`.
    fn enable(&mut self, id: ClockId) -> Result<(), ClockError>;
    /// Gates `id`.
    fn disable(&mut self, id: ClockId);
}

static PROVIDER: Once<SpinMutex<&'static mut (dyn ClockOps + Send)>> = Once::new();

/// Registers the SoC clock provider. Later registrations are ignored.
pub fn register(provider: &'static mut (dyn ClockOps + Send)) {
    PROVIDER.call_once(|| SpinMutex::new(provider));
}

/// Handle to one named clock.
#[derive(Clone, Copy, Debug)]
pub struct Clk {
    id: ClockId,
}

/// Looks a clock up by name.
pub fn clk_get(name: &str) -> Result<Clk, ClockError> {
    let id = match name {
        "gpll" => ClockId::Gpll,
        "cpll" => ClockId::Cpll,
        "ppll" => ClockId::Ppll,
        "aclk_perihp" => ClockId::AclkPerihp,
        "hclk_perihp" => ClockId::HclkPerihp,
        "pclk_perihp" => ClockId::PclkPerihp,
        "aclk_perilp0" => ClockId::AclkPerilp0,
        "hclk_perilp0" => ClockId::HclkPerilp0,
        "pclk_perilp0" => ClockId::PclkPerilp0,
        "hclk_perilp1" => ClockId::HclkPerilp1,
        "pclk_perilp1" => ClockId::PclkPerilp1,
        "aclk_emmc" => ClockId::AclkEmmc,
        "clk_emmc" => ClockId::Emmc,
        "pclk_pmu" => ClockId::PclkPmu,
        _ => return Err(ClockError::UnknownClock),
    };
    Ok(Clk { id })
}

impl Clk {
    /// The clock this handle refers to.
    pub fn id(&self) -> ClockId {
        self.id
    }

    fn with_provider<T>(
        &self,
        f: impl FnOnce(&mut dyn ClockOps) -> Result<T, ClockError>,
    ) -> Result<T, ClockError> {
        let provider = PROVIDER.get().ok_or(ClockError::NotInitialized)?;
        let mut guard = provider.lock();
        f(&mut **guard)
    }

    /// Current rate in Hz.
    pub fn get_rate(&self) -> Result<u64, ClockError> {
        self.with_provider(|ops| ops.get_rate(self.id))
    }

    /// Requests a new rate; returns the rate actually achieved.
    pub fn set_rate(&self, hz: u64) -> Result<u64, ClockError> {
        self.with_provider(|ops| ops.set_rate(self.id, hz))
    }

    /// Ungates the clock.
    pub fn enable(&self) -> Result<(), ClockError> {
        self.with_provider(|ops| ops.enable(self.id))
    }

    /// Gates the clock.
    pub fn disable(&self) {
        let _ = self.with_provider(|ops| {
            ops.disable(self.id);
            Ok(())
        });
    }
}

// CLKSEL_CON21.
const ACLK_EMMC_PLL_SEL_SHIFT: u32 = 7;
const ACLK_EMMC_PLL_SEL_MASK: u32 = 1 << ACLK_EMMC_PLL_SEL_SHIFT;
const ACLK_EMMC_PLL_SEL_GPLL: u32 = 1;
const ACLK_EMMC_DIV_MASK: u32 = 0x1f;

// CLKSEL_CON22.
const CLK_EMMC_PLL_SHIFT: u32 = 8;
const CLK_EMMC_PLL_MASK: u32 = 0x7 << CLK_EMMC_PLL_SHIFT;
const CLK_EMMC_PLL_SEL_GPLL: u32 = 0x1;
const CLK_EMMC_PLL_SEL_24M: u32 = 0x5;
const CLK_EMMC_DIV_MASK: u32 = 0x7f;

/// eMMC AXI clock target; 594 MHz / 3.
const ACLK_EMMC_HZ: u64 = 198_000_000;

/// Clock provider backed by the initialized CRU.
///
/// Owns the CRU bus handle after tree initialization; plan-fixed clocks are
/// answered from the frequency-plan constants, the eMMC leaf clock from
/// hardware.
pub struct CruClockProvider<B: MmioBus> {
    cru: B,
}

impl<B: MmioBus + Send> CruClockProvider<B> {
    /// Wraps the CRU and points the eMMC AXI clock at GPLL.
    pub fn new(mut cru: B) -> Result<Self, ClockError> {
        let aclk_div = exact_div(GPLL_HZ, ACLK_EMMC_HZ, ACLK_EMMC_DIV_MASK)?;
        masked_write(
            &mut cru,
            clksel_con(21),
            ACLK_EMMC_PLL_SEL_MASK | ACLK_EMMC_DIV_MASK,
            (ACLK_EMMC_PLL_SEL_GPLL << ACLK_EMMC_PLL_SEL_SHIFT) | aclk_div,
        );
        Ok(Self { cru })
    }

    fn emmc_rate(&mut self) -> u64 {
        let con = self.cru.read32(clksel_con(22));
        let parent = match (con & CLK_EMMC_PLL_MASK) >> CLK_EMMC_PLL_SHIFT {
            CLK_EMMC_PLL_SEL_24M => OSC_HZ,
            _ => GPLL_HZ,
        };
        parent / ((con & CLK_EMMC_DIV_MASK) as u64 + 1)
    }

    fn emmc_set_rate(&mut self, hz: u64) -> Result<u64, ClockError> {
        if hz == 0 {
            return Err(ClockError::InexactDivider {
                parent_hz: GPLL_HZ,
                target_hz: 0,
            });
        }
        // Source off GPLL when its 7-bit divider reaches the target; slow
        // ID-mode rates fall back to the 24 MHz crystal.
        let (sel, parent) = if GPLL_HZ.div_ceil(hz) <= (CLK_EMMC_DIV_MASK as u64 + 1) {
            (CLK_EMMC_PLL_SEL_GPLL, GPLL_HZ)
        } else {
            (CLK_EMMC_PLL_SEL_24M, OSC_HZ)
        };
        let div = parent.div_ceil(hz);
        if div > CLK_EMMC_DIV_MASK as u64 + 1 {
            return Err(ClockError::DividerTooLarge {
                div: div as u32 - 1,
                max: CLK_EMMC_DIV_MASK,
            });
        }
        masked_write(
            &mut self.cru,
            clksel_con(22),
            CLK_EMMC_PLL_MASK | CLK_EMMC_DIV_MASK,
            (sel << CLK_EMMC_PLL_SHIFT) | (div as u32 - 1),
        );
        let achieved = parent / div;
        debug!("clk_emmc: requested {hz} Hz, achieved {achieved} Hz");
        Ok(achieved)
    }
}

impl<B: MmioBus + Send> ClockOps for CruClockProvider<B> {
    fn get_rate(&mut self, id: ClockId) -> Result<u64, ClockError> {
        Ok(match id {
            ClockId::Gpll => GPLL_HZ,
            ClockId::Cpll => CPLL_HZ,
            // Integer feedback division puts the PMU PLL at 672 MHz.
            ClockId::Ppll => 672_000_000,
            ClockId::AclkPerihp | ClockId::HclkPerihp => 148_500_000,
            ClockId::PclkPerihp => 37_125_000,
            ClockId::AclkPerilp0 | ClockId::HclkPerilp0 | ClockId::HclkPerilp1 => 99_000_000,
            ClockId::PclkPerilp0 | ClockId::PclkPerilp1 => 49_500_000,
            ClockId::AclkEmmc => ACLK_EMMC_HZ,
            ClockId::Emmc => self.emmc_rate(),
            ClockId::PclkPmu => PMU_PCLK_HZ,
        })
    }

    fn set_rate(&mut self, id: ClockId, hz: u64) -> Result<u64, ClockError> {
        match id {
            ClockId::Emmc => self.emmc_set_rate(hz),
            // Plan-fixed clocks accept only their plan rate.
            _ => {
                let fixed = self.get_rate(id)?;
                if fixed == hz {
                    Ok(fixed)
                } else {
                    Err(ClockError::InexactDivider {
                        parent_hz: fixed,
                        target_hz: hz,
                    })
                }
            }
        }
    }

    fn enable(&mut self, id: ClockId) -> Result<(), ClockError> {
        // Gates are left as the boot ROM set them; nothing to open here.
        debug!("clk enable: {id:?}");
        Ok(())
    }

    fn disable(&mut self, id: ClockId) {
        debug!("clk disable: {id:?}");
    }
}
