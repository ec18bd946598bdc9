// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Sandbox entry point.
//!
//! Without arguments, boots the simulated board once and reads back the
//! first eMMC sectors. With `--fuzz [target]`, selects a fuzz target (the
//! explicit name, the `ROCKBOOT_FUZZ_TARGET` environment variable, or the
//! executable filename with its `fuzz-` prefix stripped) and replays
//! every input file named on the command line (stdin when none are given)
//! through the two-context harness.

mod board;
mod fuzz;
mod hw;
mod logger;

use fuzz::FuzzHarness;
use log::{error, info};
use std::env;
use std::io::Read;
use std::process::ExitCode;

fn run_fuzz(target: Option<String>, inputs: &[String]) -> ExitCode {
    let from_env = env::var("ROCKBOOT_FUZZ_TARGET").ok();
    let argv0 = env::args().next().unwrap_or_default();
    let name = target
        .or(from_env)
        .or_else(|| fuzz::target_from_executable(&argv0).map(str::to_owned))
        .unwrap_or_default();

    let Some(test) = fuzz::find(&name) else {
        error!("unknown fuzz target '{name}'");
        fuzz::call_for_each_fuzz_test(|test| {
            info!("available: {}", test.name);
            0
        });
        return ExitCode::FAILURE;
    };

    let harness = FuzzHarness::spawn(test);

    if inputs.is_empty() {
        let mut data = Vec::new();
        if std::io::stdin().read_to_end(&mut data).is_err() {
            error!("cannot read fuzz input from stdin");
            return ExitCode::FAILURE;
        }
        let ret = harness.run_once(&data);
        info!("1 input replayed");
        return if ret == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    for path in inputs {
        match std::fs::read(path) {
            Ok(data) => {
                let ret = harness.run_once(&data);
                info!("{path}: {ret}");
                if ret != 0 {
                    return ExitCode::FAILURE;
                }
            }
            Err(err) => {
                error!("{path}: {err}");
                return ExitCode::FAILURE;
            }
        }
    }
    info!("{} inputs replayed", inputs.len());
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let _ = logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if let Some(at) = args.iter().position(|arg| arg == "--fuzz") {
        // The target name, if present, is the argument right after the
        // flag; everything else is input files.
        let target = args.get(at + 1).filter(|a| !a.starts_with('-')).cloned();
        let skip = if target.is_some() { at + 2 } else { at + 1 };
        let inputs: Vec<String> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < at || *i >= skip)
            .map(|(_, a)| a.clone())
            .collect();
        return run_fuzz(target, &inputs);
    }

    match board::run_board() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("sandbox boot failed: {err}");
            ExitCode::FAILURE
        }
    }
}
