// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The sandbox board: the full boot path wired to simulated hardware.
//!
//! Mirrors what the real board does at early boot: low-level init over
//! CRU/GRF/SGRF, clock provider registration, SDHCI bring-up through the
//! PHY, then block reads off the eMMC image. Also the body of
//! the `mmc` fuzz target, which replays the same storage path against a
//! controller scripted by the fuzz input.

use crate::fuzz::{FUZZ_TESTS, FuzzTest};
use crate::hw::{self, EmmcController, Fault};
use linkme::distributed_slice;
use log::info;
use rockboot::block::{BlockDevice, BlockError, MciBlockDevice, SECTOR_SIZE};
use rockboot::clk::{self, CruClockProvider, clk_get};
use rockboot::clock::ClockError;
use rockboot::mci::{BusWidth, Command, Ios, MciError, MciHost, ResponseType, Timing, cmd};
use rockboot::mmio::fake::HiwordFake;
use rockboot::regmap::MmioRegmap;
use rockboot::rk3399::{BoardError, emmc_phy, lowlevel_init};
use rockboot::sdhci::regs::IntStatus;
use rockboot::sdhci::{EMMC_MIN_FREQ, SdhciHost, phy::EmmcPhy};
use thiserror::Error;

type SandboxGrf = MmioRegmap<HiwordFake<0x1_0000>>;
type SandboxHost = SdhciHost<EmmcController, EmmcPhy<SandboxGrf>>;

/// Anything the sandbox boot path can fail with.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum SandboxError {
    /// Low-level init failed.
    #[error(transparent)]
    Board(#[from] BoardError),
    /// Clock framework failure.
    #[error(transparent)]
    Clock(#[from] ClockError),
    /// Storage controller failure.
    #[error(transparent)]
    Mci(#[from] MciError),
    /// Block layer failure.
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// The brought-up board: an enumerated eMMC behind the block layer.
pub struct SandboxBoard {
    emmc: MciBlockDevice<SandboxHost>,
}

/// Runs the early-boot path against fresh simulated hardware and hands
/// back the enumerated board.
pub fn bring_up(image: Vec<u8>) -> Result<SandboxBoard, SandboxError> {
    let num_blocks = (image.len() / SECTOR_SIZE) as u64;

    let mut cru = hw::cru_model();
    let mut pmucru = hw::cru_model();
    let mut grf = hw::grf_model();
    let mut sgrf = hw::pmusgrf_model();

    lowlevel_init(&mut cru, &mut pmucru, &mut grf, &mut sgrf)?;

    // The CRU moves into the clock provider; consumers reach it through
    // handles from here on.
    clk::register(Box::leak(Box::new(CruClockProvider::new(cru)?)));
    let clk_emmc = clk_get("clk_emmc")?;

    let mut host = SdhciHost::new(EmmcController::new(image))
        .with_phy(emmc_phy(grf))
        .with_input_clock(clk_emmc);
    host.setup_host(0, EMMC_MIN_FREQ)?;
    clk_emmc.set_rate(host.f_max as u64)?;
    host.init()?;

    // Identification at 400 kHz, then switch up for transfers.
    host.set_ios(&Ios {
        clock_hz: EMMC_MIN_FREQ,
        bus_width: BusWidth::One,
        timing: Timing::Legacy,
    })?;
    host.send_command(
        &Command::new(cmd::GO_IDLE_STATE, 0, ResponseType::NONE),
        None,
    )?;
    host.set_ios(&Ios {
        clock_hz: 52_000_000,
        bus_width: BusWidth::Eight,
        timing: Timing::MmcHs,
    })?;

    info!("sandbox eMMC up: {num_blocks} sectors");
    Ok(SandboxBoard {
        emmc: MciBlockDevice::new(host, num_blocks),
    })
}

impl SandboxBoard {
    /// The block device view of the eMMC.
    pub fn emmc(&mut self) -> &mut MciBlockDevice<SandboxHost> {
        &mut self.emmc
    }
}

/// A deterministic disk image for the demo boot.
pub fn demo_image() -> Vec<u8> {
    (0..16 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Boots the sandbox board once and reads back the first sectors.
pub fn run_board() -> Result<(), SandboxError> {
    let image = demo_image();
    let mut board = bring_up(image.clone())?;

    let mut buf = [0u8; 2 * SECTOR_SIZE];
    board.emmc().read_blocks(0, &mut buf)?;
    assert_eq!(&buf[..], &image[..2 * SECTOR_SIZE]);
    info!("read {} bytes from sector 0", buf.len());
    Ok(())
}

/// `mmc` fuzz target: the input scripts a data-phase fault and supplies the
/// card contents; the storage path must either deliver the exact image
/// bytes or fail cleanly with the controller reset.
fn fuzz_mmc(data: &[u8]) -> i32 {
    if data.len() < 4 {
        return 0;
    }
    let after_bytes = u16::from_le_bytes([data[0], data[1]]) as usize;
    let fault_bits = match data[2] % 4 {
        0 => None,
        1 => Some(IntStatus::DATA_CRC.bits()),
        2 => Some(IntStatus::DATA_TIMEOUT.bits()),
        _ => Some(IntStatus::DATA_END_BIT.bits()),
    };
    let image: Vec<u8> = data[3..]
        .iter()
        .cycle()
        .take(4 * SECTOR_SIZE)
        .copied()
        .collect();

    let mut controller = EmmcController::new(image.clone());
    if let Some(bits) = fault_bits {
        controller.inject_fault(Fault {
            after_bytes,
            bits,
        });
    }

    let mut host = SdhciHost::new(controller).with_phy(emmc_phy(hw::grf_model()));
    if host.setup_host(0, EMMC_MIN_FREQ).is_err() || host.init().is_err() {
        return 1;
    }
    let ios = Ios {
        clock_hz: EMMC_MIN_FREQ,
        bus_width: BusWidth::One,
        timing: Timing::Legacy,
    };
    if host.set_ios(&ios).is_err() {
        return 1;
    }

    let mut dev = MciBlockDevice::new(host, 4);
    let mut buf = [0u8; 2 * SECTOR_SIZE];
    match dev.read_blocks(0, &mut buf) {
        Ok(()) => {
            // A clean read must deliver the image verbatim.
            assert_eq!(&buf[..], &image[..2 * SECTOR_SIZE]);
        }
        Err(_) => {
            // A failed read must have left the controller reset for the
            // caller's retry.
            assert!(!dev.host_mut().bus_mut().resets.is_empty());
        }
    }
    0
}

/// Registration for the `mmc` target.
#[distributed_slice(FUZZ_TESTS)]
pub static FUZZ_MMC: FuzzTest = FuzzTest {
    name: "mmc",
    run: fuzz_mmc,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_boots_and_reads() {
        run_board().unwrap();
    }

    #[test]
    fn fuzz_target_survives_clean_and_faulted_inputs() {
        // Clean run.
        assert_eq!(fuzz_mmc(&[0, 0, 0, 0xaa, 0x55]), 0);
        // CRC fault after 64 bytes.
        assert_eq!(fuzz_mmc(&[64, 0, 1, 0xaa, 0x55]), 0);
        // Degenerate input.
        assert_eq!(fuzz_mmc(&[]), 0);
    }
}
