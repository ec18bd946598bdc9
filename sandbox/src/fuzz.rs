// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Fuzz-target registry and the two-context execution harness.
//!
//! Targets register themselves into a distributed slice; the driver picks
//! one by name (an explicit argument, the `ROCKBOOT_FUZZ_TARGET`
//! environment variable, or the executable's own filename with its `fuzz-`
//! prefix stripped) and feeds it inputs one at a time.
//!
//! The driver and the boot loop are two logical execution contexts with a
//! strict contract: alternating execution, explicit transfer, never
//! preemptive, no cancellation. A pair of rendezvous channels gives exactly
//! that: each side parks in `recv` until the other yields.

use linkme::distributed_slice;
use log::info;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

/// One registered fuzz target.
pub struct FuzzTest {
    /// Name used for selection.
    pub name: &'static str,
    /// Runs one input to completion; returns a status code, zero for a
    /// clean iteration.
    pub run: fn(&[u8]) -> i32,
}

/// All registered fuzz targets.
#[distributed_slice]
pub static FUZZ_TESTS: [FuzzTest];

/// Calls `f` for every registered target, stopping at the first error.
pub fn call_for_each_fuzz_test(mut f: impl FnMut(&'static FuzzTest) -> i32) -> i32 {
    for test in FUZZ_TESTS.iter() {
        let ret = f(test);
        if ret != 0 {
            return ret;
        }
    }
    0
}

/// Looks a target up by name.
pub fn find(name: &str) -> Option<&'static FuzzTest> {
    FUZZ_TESTS.iter().find(|test| test.name == name)
}

/// Derives the target name from an executable path: the file name with a
/// `fuzz-` prefix stripped.
pub fn target_from_executable(argv0: &str) -> Option<&str> {
    let file = argv0.rsplit('/').next()?;
    Some(file.strip_prefix("fuzz-").unwrap_or(file))
}

/// The driver half of the harness.
///
/// The boot context runs the target in its own thread; `run_once` hands an
/// input over a zero-capacity channel and parks until the matching result
/// comes back, so exactly one context is ever runnable and control transfer
/// is explicit on both sides. Once an iteration starts it runs to
/// completion; there is no cancellation.
pub struct FuzzHarness {
    input_tx: SyncSender<Vec<u8>>,
    result_rx: Receiver<i32>,
}

impl FuzzHarness {
    /// Spawns the boot context for `test`.
    pub fn spawn(test: &'static FuzzTest) -> Self {
        let (input_tx, input_rx) = sync_channel::<Vec<u8>>(0);
        let (result_tx, result_rx) = sync_channel::<i32>(0);
        thread::spawn(move || {
            while let Ok(input) = input_rx.recv() {
                let ret = (test.run)(&input);
                if result_tx.send(ret).is_err() {
                    break;
                }
            }
        });
        info!("fuzzing target '{}'", test.name);
        Self {
            input_tx,
            result_rx,
        }
    }

    /// Runs one fuzz iteration to completion and returns its status.
    pub fn run_once(&self, data: &[u8]) -> i32 {
        self.input_tx
            .send(data.to_vec())
            .expect("boot context exited");
        self.result_rx.recv().expect("boot context exited")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static ITERATIONS: AtomicU32 = AtomicU32::new(0);
    static REENTRY: AtomicU32 = AtomicU32::new(0);

    fn run_counting(data: &[u8]) -> i32 {
        // Detect overlapped execution: the harness promises strict
        // alternation, so this must never observe itself running twice.
        assert_eq!(REENTRY.fetch_add(1, Ordering::SeqCst), 0);
        ITERATIONS.fetch_add(1, Ordering::SeqCst);
        let ret = i32::from(data.first().copied().unwrap_or(0));
        REENTRY.fetch_sub(1, Ordering::SeqCst);
        ret
    }

    #[distributed_slice(FUZZ_TESTS)]
    static COUNTING: FuzzTest = FuzzTest {
        name: "counting",
        run: run_counting,
    };

    #[test]
    fn registry_finds_targets_by_name() {
        assert!(find("counting").is_some());
        assert!(find("missing").is_none());
    }

    #[test]
    fn executable_name_derivation() {
        assert_eq!(target_from_executable("/usr/bin/fuzz-mmc"), Some("mmc"));
        assert_eq!(target_from_executable("fuzz-mmc"), Some("mmc"));
        // No prefix: the whole file name is the target.
        assert_eq!(target_from_executable("/opt/rockboot-sandbox"), Some("rockboot-sandbox"));
    }

    #[test]
    fn harness_alternates_strictly() {
        let harness = FuzzHarness::spawn(find("counting").unwrap());
        let before = ITERATIONS.load(Ordering::SeqCst);
        assert_eq!(harness.run_once(&[0]), 0);
        assert_eq!(harness.run_once(&[7]), 7);
        assert_eq!(harness.run_once(&[1, 2, 3]), 1);
        assert_eq!(ITERATIONS.load(Ordering::SeqCst) - before, 3);
    }
}
