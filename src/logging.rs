//! Structured logging setup (§4.6 of the design doc).
//!
//! Every subsystem logs through `tracing` rather than `println!`.
//! Verbosity is controlled by `-d`: 0 maps to warnings/errors only, 1 to
//! informational events, 2 to debug-level protocol tracing. Output goes
//! to stderr by default or to a rotating daily file when `-l` is given;
//! colour is used only on the stderr path and only when it's a real
//! terminal.

use std::io::IsTerminal;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

/// Map `-d <level>` onto a tracing level filter.
fn level_filter(debug_level: u8) -> LevelFilter {
    match debug_level {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// Initialize the global tracing subscriber. The returned guard, if any,
/// must be held for the life of the process — dropping it flushes and
/// stops the non-blocking file writer.
pub fn init(debug_level: u8, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = level_filter(debug_level);

    match log_file {
        None => {
            let ansi = std::io::stderr().is_terminal();
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .with_target(false)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).init();
            None
        }
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let filename = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("irkerd.log"));
            let appender = tracing_appender::rolling::daily(dir, filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).init();
            Some(guard)
        }
    }
}
