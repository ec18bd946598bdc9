// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! eMMC PHY power sequencing and calibration.
//!
//! The PHY sits in the GRF, so everything here goes through a [`Regmap`]
//! handle with write-enable-masked updates. Power-up runs pad calibration
//! (best effort: a missed CALDONE is logged and boot continues, since the
//! ID-mode transfers that follow work without it), selects the DLL band for
//! the target clock and runs a bounded wait for DLL lock.

use crate::regmap::{Regmap, RegmapError, hiword_update};
use log::warn;
use thiserror::Error;

/// Errors from PHY control.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum PhyError {
    /// The underlying regmap rejected an access.
    #[error(transparent)]
    Regmap(#[from] RegmapError),
}

/// Power control the SDHCI core drives around clock-rate changes.
pub trait SdhciPhy {
    /// Powers the PHY up, calibrated for a card clock of `clock_hz`.
    fn power_on(&mut self, clock_hz: u32) -> Result<(), PhyError>;

    /// Powers the PHY down.
    fn power_off(&mut self) -> Result<(), PhyError>;
}

const PHYCTRL_CALDONE_SHIFT: u32 = 6;
const PHYCTRL_CALDONE_MASK: u32 = 0x1;
const PHYCTRL_DLLRDY_SHIFT: u32 = 5;
const PHYCTRL_DLLRDY_MASK: u32 = 0x1;
const PHYCTRL_FREQSEL_200M: u32 = 0x0;
const PHYCTRL_FREQSEL_50M: u32 = 0x1;
const PHYCTRL_FREQSEL_100M: u32 = 0x2;
const PHYCTRL_FREQSEL_150M: u32 = 0x3;

/// DLL-ready poll budget, in 1 µs steps.
const DLLRDY_POLL_US: u32 = 5000;

const MHZ: u32 = 1_000_000;

/// The RK3399 eMMC PHY: seven control registers and a status register
/// inside the GRF.
pub struct EmmcPhy<R: Regmap> {
    grf: R,
    base: u32,
    calibration_done: bool,
}

impl<R: Regmap> EmmcPhy<R> {
    /// Binds the PHY at byte offset `base` within `grf`.
    pub fn new(grf: R, base: u32) -> Self {
        Self {
            grf,
            base,
            calibration_done: false,
        }
    }

    /// Whether the last power-up saw pad calibration complete.
    pub fn calibration_done(&self) -> bool {
        self.calibration_done
    }

    fn con(&self, n: u32) -> u32 {
        self.base + 4 * n
    }

    fn status(&mut self) -> Result<u32, PhyError> {
        Ok(self.grf.read(self.base + 0x20)?)
    }
}

impl<R: Regmap> SdhciPhy for EmmcPhy<R> {
    fn power_on(&mut self, clock_hz: u32) -> Result<(), PhyError> {
        self.calibration_done = false;

        self.grf.write(self.con(6), hiword_update(0x7 << 4, 0))?;
        self.grf.write(self.con(0), hiword_update(1 << 11, 1 << 11))?;
        self.grf.write(self.con(0), hiword_update(0xf << 7, 6 << 7))?;

        // The manual quotes a >2 us calpad calibration cycle; leave margin.
        crate::arch::udelay(3);
        self.grf.write(self.con(6), hiword_update(1, 1))?;

        // The quoted 5 us for calpad busy trimming is not enough in
        // practice.
        crate::arch::udelay(500);
        let caldone = (self.status()? >> PHYCTRL_CALDONE_SHIFT) & PHYCTRL_CALDONE_MASK;
        if caldone != 1 {
            warn!("eMMC PHY: caldone timeout");
            return Ok(());
        }
        self.calibration_done = true;

        let freqsel = if clock_hz < 75 * MHZ {
            PHYCTRL_FREQSEL_50M
        } else if clock_hz < 125 * MHZ {
            PHYCTRL_FREQSEL_100M
        } else if clock_hz < 175 * MHZ {
            PHYCTRL_FREQSEL_150M
        } else {
            PHYCTRL_FREQSEL_200M
        };

        // Set the frequency of the DLL operation, then start it.
        self.grf
            .write(self.con(0), hiword_update(0x3 << 12, freqsel << 12))?;
        self.grf.write(self.con(6), hiword_update(1 << 1, 1 << 1))?;

        // REN enable on the STRB line for HS400.
        self.grf.write(self.con(2), hiword_update(0, 1 << 9))?;

        let mut ready = false;
        for _ in 0..DLLRDY_POLL_US {
            let dllrdy = (self.status()? >> PHYCTRL_DLLRDY_SHIFT) & PHYCTRL_DLLRDY_MASK;
            if dllrdy == 1 {
                ready = true;
                break;
            }
            crate::arch::udelay(1);
        }
        if !ready {
            warn!("eMMC PHY: DLL not ready");
        }
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), PhyError> {
        self.grf.write(self.con(6), hiword_update(1, 0))?;
        self.grf.write(self.con(6), hiword_update(1 << 1, 0))?;
        Ok(())
    }
}
