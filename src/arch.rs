// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Architecture helpers: barriers and the microsecond busy-wait.
//!
//! Everything here compiles to a no-op off-target, so host-side tests and
//! the sandbox run the exact same driver code with fake time (their register
//! models advance state on access instead of on wall-clock time).

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Issues a full-system data synchronization barrier (`dsb sy`).
///
/// Required after a device register write that gates a subsequent poll, so
/// the write is observable by the device before the first status read.
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Frequency of the generic timer counter, as programmed by the boot ROM.
#[cfg(target_arch = "aarch64")]
const STIMER_HZ: u64 = 24_000_000;

#[cfg(target_arch = "aarch64")]
fn counter() -> u64 {
    let cnt: u64;
    // SAFETY: Reading the virtual counter has no side effects.
    unsafe {
        asm!("mrs {cnt}, cntvct_el0", cnt = out(reg) cnt, options(nostack, nomem));
    }
    cnt
}

/// Spins for at least `us` microseconds.
///
/// On aarch64 this polls the generic timer counter. Elsewhere it is a no-op:
/// simulated hardware advances on register access, not on time.
pub fn udelay(us: u64) {
    #[cfg(target_arch = "aarch64")]
    {
        let end = counter() + us * (STIMER_HZ / 1_000_000);
        while counter() < end {
            core::hint::spin_loop();
        }
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = us;
}
