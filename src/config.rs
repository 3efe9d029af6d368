//! Bundled runtime tunables, shared by the dispatcher, every server
//! session, and every channel session.
//!
//! The distilled spec notes that exact burst/pacing constants vary by IRC
//! network and that implementations should expose them as tunables rather
//! than hard-coding them three call sites deep. Bundling them in one
//! `Clone`-able struct is how that's done here instead of threading ten
//! separate `Duration` arguments through every constructor.

use std::time::Duration;

use crate::defaults;

#[derive(Debug, Clone, Copy)]
pub struct Tunables {
    pub queue_max: usize,
    pub anti_flood_gap: Duration,
    pub burst: usize,
    pub channel_ttl: Duration,
    pub server_ttl: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnects: u32,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            queue_max: defaults::QUEUE_MAX,
            anti_flood_gap: defaults::ANTI_FLOOD_GAP,
            burst: defaults::BURST,
            channel_ttl: defaults::CHANNEL_TTL,
            server_ttl: defaults::SERVER_TTL,
            reconnect_base: defaults::RECONNECT_BASE,
            reconnect_cap: defaults::RECONNECT_CAP,
            max_reconnects: defaults::MAX_RECONNECTS,
            ping_interval: defaults::PING_INTERVAL,
            ping_timeout: defaults::PING_TIMEOUT,
            shutdown_grace: defaults::SHUTDOWN_GRACE,
        }
    }
}
