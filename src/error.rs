//! Error taxonomy for the daemon.
//!
//! Library code returns [`DaemonError`] so callers can match on kind rather
//! than grep a string. `main` still wraps the top-level startup sequence in
//! `anyhow::Result` the way the rest of this codebase's binaries do.

use thiserror::Error;

/// Errors surfaced by target-URL parsing (§4.5 of the design doc).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TargetError {
    #[error("unsupported scheme {0:?}, expected \"irc\" or \"ircs\"")]
    UnsupportedScheme(String),

    #[error("target URL has no host")]
    MissingHost,

    #[error("target URL has no channel")]
    MissingChannel,

    #[error("target URL could not be parsed: {0}")]
    Malformed(String),
}

/// Errors surfaced while validating an ingress request object.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid target url: {0}")]
    Target(#[from] TargetError),

    #[error("\"to\" must be a string or a non-empty array of strings")]
    EmptyTargetList,
}

/// Top-level daemon error kinds, used to pick an exit code in `main`.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to bind ingress listener on {addr}: {source}")]
    IngressBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind unix ingress socket at {path}: {source}")]
    UnixBind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
