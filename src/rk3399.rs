// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! RK3399 SoC bring-up glue.
//!
//! Physical block addresses and the low-level init sequence entered from
//! the boot ROM. The addresses are contractual: every driver in this crate
//! is handed its block through an [`MmioBus`]/[`Regmap`] handle built from
//! these constants, and the sandbox substitutes simulated blocks at the
//! same offsets.

use crate::clock::{ClockError, clock_init};
use crate::mmio::{DeviceMmio, MmioBus};
use crate::regmap::{MmioRegmap, Regmap, RegmapError, hiword_update};
use crate::sdhci::phy::EmmcPhy;
use log::info;
use thiserror::Error;

/// Clock and reset unit.
pub const CRU_BASE: usize = 0xff76_0000;
/// PMU-domain clock and reset unit.
pub const PMUCRU_BASE: usize = 0xff75_0000;
/// General register file.
pub const GRF_BASE: usize = 0xff77_0000;
/// Secure general register file in the PMU domain.
pub const PMUSGRF_BASE: usize = 0xff33_0000;
/// Arasan SDHCI controller (eMMC).
pub const SDHCI_BASE: usize = 0xfe33_0000;

/// Size of the GRF window.
pub const GRF_SIZE: u32 = 0x1_0000;
/// Size of the PMUSGRF window.
pub const PMUSGRF_SIZE: u32 = 0x1_0000;

/// eMMC PHY control block, as a byte offset into the GRF.
pub const GRF_EMMCPHY_BASE: u32 = 0xf780;
/// eMMC core control register 11 within the GRF.
pub const GRF_EMMCCORE_CON11: u32 = 0xf02c;

/// DDR security region control 16 within the PMUSGRF.
pub const PMUSGRF_DDR_RGN_CON16: u32 = 0x40;
/// Slave security control 4 within the PMUSGRF.
pub const PMUSGRF_SLV_SECURE_CON4: u32 = 0xe3d4;

/// Failures during SoC bring-up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum BoardError {
    /// Clock tree configuration failed.
    #[error(transparent)]
    Clock(#[from] ClockError),
    /// A GRF/SGRF poke was rejected.
    #[error(transparent)]
    Regmap(#[from] RegmapError),
}

/// Low-level init, entered once from the boot ROM before any peripheral is
/// used: open the security windows, quiesce the eMMC clock generator and
/// bring the clock tree up.
pub fn lowlevel_init<B, G, S>(
    cru: &mut B,
    pmucru: &mut B,
    grf: &mut G,
    sgrf: &mut S,
) -> Result<(), BoardError>
where
    B: MmioBus,
    G: Regmap,
    S: Regmap,
{
    // The boot ROM protects the first megabyte of DRAM. The MMC controller
    // DMAs from buffers that may sit there, so drop both security regions
    // before storage comes up.
    sgrf.write(PMUSGRF_DDR_RGN_CON16, hiword_update(0x1ff, 0))?;
    sgrf.write(PMUSGRF_SLV_SECURE_CON4, hiword_update(0x2000, 0))?;

    // eMMC clock generator: disable the clock multiplier.
    grf.write(GRF_EMMCCORE_CON11, hiword_update(0xff, 0))?;

    clock_init(cru, pmucru)?;
    info!("rk3399: clocks configured");
    Ok(())
}

/// Hardware handle for the CRU.
///
/// # Safety
///
/// Only on RK3399 with the block mapped; at most one handle may exist.
pub unsafe fn cru() -> DeviceMmio {
    // SAFETY: Forwarded to the caller.
    unsafe { DeviceMmio::new(CRU_BASE as *mut u8) }
}

/// Hardware handle for the PMUCRU.
///
/// # Safety
///
/// Only on RK3399 with the block mapped; at most one handle may exist.
pub unsafe fn pmucru() -> DeviceMmio {
    // SAFETY: Forwarded to the caller.
    unsafe { DeviceMmio::new(PMUCRU_BASE as *mut u8) }
}

/// Hardware handle for the SDHCI controller.
///
/// # Safety
///
/// Only on RK3399 with the block mapped; at most one handle may exist.
pub unsafe fn sdhci() -> DeviceMmio {
    // SAFETY: Forwarded to the caller.
    unsafe { DeviceMmio::new(SDHCI_BASE as *mut u8) }
}

/// Regmap over the GRF window.
///
/// # Safety
///
/// Only on RK3399 with the block mapped; at most one handle may exist.
pub unsafe fn grf() -> MmioRegmap<DeviceMmio> {
    // SAFETY: Forwarded to the caller.
    MmioRegmap::new(unsafe { DeviceMmio::new(GRF_BASE as *mut u8) }, GRF_SIZE)
}

/// Regmap over the PMUSGRF window.
///
/// # Safety
///
/// Only on RK3399 with the block mapped; at most one handle may exist.
pub unsafe fn pmusgrf() -> MmioRegmap<DeviceMmio> {
    // SAFETY: Forwarded to the caller.
    MmioRegmap::new(
        unsafe { DeviceMmio::new(PMUSGRF_BASE as *mut u8) },
        PMUSGRF_SIZE,
    )
}

/// The eMMC PHY bound to a GRF regmap.
pub fn emmc_phy<R: Regmap>(grf: R) -> EmmcPhy<R> {
    EmmcPhy::new(grf, GRF_EMMCPHY_BASE)
}
