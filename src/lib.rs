//! # irkerd
//!
//! A submit-only IRC relay daemon. Notification producers open a short-lived
//! local connection, write one or more JSON request objects, and close;
//! `irkerd` takes care of connecting to the target IRC server, joining the
//! target channel, pacing the outgoing `PRIVMSG` traffic to stay under flood
//! thresholds, and reconnecting when the network misbehaves.
//!
//! The daemon never reads the message content and never authenticates
//! producers: the ingress transport is assumed local and trusted.

pub mod channel;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ingress;
pub mod logging;
pub mod request;
pub mod server;
pub mod target;
pub mod tls;
pub mod wire;

pub use cli::Args;
pub use config::Tunables;
pub use dispatcher::Dispatcher;
pub use target::{ServerKey, Target};

/// The current version of the daemon.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compiled-in tunables. Every constant here is overridable in principle
/// (§9's open question on burst/pacing varying by network); the CLI exposes
/// the ones that matter most in practice and the rest remain build-time
/// defaults, matching how this codebase treats other timing constants.
pub mod defaults {
    use std::time::Duration;

    /// Default ingress TCP port.
    pub const INGRESS_PORT: u16 = 6659;

    /// Capacity of a channel session's outbound queue.
    pub const QUEUE_MAX: usize = 128;

    /// Minimum inter-message gap enforced once the burst credit is spent.
    pub const ANTI_FLOOD_GAP: Duration = Duration::from_secs(1);

    /// Messages that may be emitted back-to-back before pacing kicks in.
    pub const BURST: usize = 4;

    /// How long an empty channel queue may sit idle before PART+evict.
    pub const CHANNEL_TTL: Duration = Duration::from_secs(240);

    /// How long a server session with zero channels may sit idle before
    /// QUIT+close.
    pub const SERVER_TTL: Duration = Duration::from_secs(60);

    /// Base delay for the reconnect backoff curve.
    pub const RECONNECT_BASE: Duration = Duration::from_secs(2);

    /// Cap on the reconnect backoff curve.
    pub const RECONNECT_CAP: Duration = Duration::from_secs(30 * 60);

    /// Consecutive reconnect failures before the server session is evicted
    /// outright.
    pub const MAX_RECONNECTS: u32 = 12;

    /// How long without any server traffic before we send an idle PING.
    pub const PING_INTERVAL: Duration = Duration::from_secs(180);

    /// How long to wait for a PONG (or any traffic) after a PING before
    /// forcing a disconnect.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

    /// Grace period for a cooperative shutdown before sockets are forced
    /// closed.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
}
