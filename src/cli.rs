//! Command-line surface for `irkerd` (§4.6 / §6 of the design doc).
//!
//! A typed parser rather than hand-rolled flag scanning: `clap`'s derive
//! API gives us range validation (port as `u16`, bind address as
//! `IpAddr`), `--help`/`--version` generation, and exit code 2 on bad
//! usage for free.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

/// `irkerd` — a submit-only IRC relay daemon.
///
/// Producers submit `{"to": ..., "privmsg": ...}` JSON objects on the
/// ingress listener; irkerd takes care of connecting, joining, pacing,
/// and reconnecting on their behalf.
#[derive(Parser, Debug, Clone)]
#[command(name = "irkerd", author, version, about, long_about = None)]
pub struct Args {
    /// Log verbosity: 0 = errors only, 1 = events (connects, joins,
    /// drops, reconnects), 2 = full protocol trace (keys redacted).
    #[arg(short = 'd', long = "debug-level", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    pub debug_level: u8,

    /// Log file path. Defaults to stderr.
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Default nick used for any target that doesn't override it with
    /// `?nick=`. Defaults to a name derived from the process and PID.
    #[arg(short = 'n', long = "nick")]
    pub nick: Option<String>,

    /// Ingress TCP port.
    #[arg(short = 'p', long = "port", default_value_t = crate::defaults::INGRESS_PORT)]
    pub port: u16,

    /// Ingress bind address.
    #[arg(short = 'i', long = "bind", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    /// Optional UNIX-domain ingress socket path. Additive to the TCP
    /// listener, not a replacement for it.
    #[arg(short = 'u', long = "unix-socket")]
    pub unix_socket: Option<PathBuf>,
}

impl Args {
    /// Resolve the default nick: the `-n` flag if given, otherwise a name
    /// derived from the process name and a hash of the PID so that
    /// multiple irkerd instances on one host don't collide by default.
    pub fn default_nick(&self) -> String {
        self.nick.clone().unwrap_or_else(derive_default_nick)
    }
}

fn derive_default_nick() -> String {
    let pid = std::process::id();
    // A short, stable-per-process suffix. Not cryptographic; just enough
    // spread that two daemons on the same host don't pick the same nick.
    let hash = pid.wrapping_mul(2654435761) % 10_000;
    format!("irkerd{hash:04}")
}
