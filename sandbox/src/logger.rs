// Copyright The Rockboot Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Stdout logger for the sandbox board.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Once;

static LOGGER: Once<Logger> = Once::new();

struct Logger;

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        println!("{}: {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the stdout logger.
pub fn init() -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| Logger);
    log::set_logger(logger)?;
    log::set_max_level(build_time_log_level());
    Ok(())
}

/// Returns the logging [`LevelFilter`] set by the build-time environment
/// variable `LOG_LEVEL`: "off", "error", "warn", "info", "debug" or
/// "trace". Absent or unrecognized values select `Info`.
pub const fn build_time_log_level() -> LevelFilter {
    let level = match option_env!("LOG_LEVEL") {
        Some(level) => level,
        None => "",
    };
    match level.as_bytes() {
        b"off" => LevelFilter::Off,
        b"error" => LevelFilter::Error,
        b"warn" => LevelFilter::Warn,
        b"info" => LevelFilter::Info,
        b"debug" => LevelFilter::Debug,
        b"trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
