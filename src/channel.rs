//! Channel session: per-channel send queue, join protocol, and
//! flood-control pacing (§4.4 of the design doc).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Tunables;
use crate::server::ServerHandle;
use crate::wire;

/// Join-state machine for a single channel on a single server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    NotJoined,
    Joining,
    Joined,
    Rejected,
}

/// A bounded drop-oldest FIFO. Guarded by a plain [`Mutex`] (never held
/// across an `.await`) with a [`Notify`] to wake the one consumer.
struct Queue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    overflow: AtomicU64,
}

impl Queue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            overflow: AtomicU64::new(0),
        }
    }

    /// Push a line, dropping the oldest entry if the queue is full.
    fn push(&self, line: String) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(line);
        drop(items);
        self.notify.notify_one();
    }

    fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Wait for and pop the head of the queue.
    async fn pop(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(line) = self.items.lock().unwrap().pop_front() {
                return line;
            }
            notified.await;
        }
    }

    /// Drop every queued line, e.g. after a join rejection.
    fn drain(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let n = items.len();
        items.clear();
        n
    }
}

/// Shared state for one (server, channel) pair. Cheap to clone via `Arc`;
/// the reader task, the pacer task, and the idle sweep all hold a handle.
pub struct ChannelSession {
    pub name: String,
    pub key: Option<String>,
    queue: Queue,
    join_state: Mutex<JoinState>,
    join_notify: Notify,
    last_activity: Mutex<Instant>,
}

impl ChannelSession {
    pub fn new(name: String, key: Option<String>, queue_max: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            key,
            queue: Queue::new(queue_max),
            join_state: Mutex::new(JoinState::NotJoined),
            join_notify: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Enqueue a line for delivery and refresh the idle clock.
    pub fn enqueue(&self, line: String) {
        self.queue.push(line);
        self.touch();
    }

    pub fn overflow_count(&self) -> u64 {
        self.queue.overflow.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// A channel is idle once its queue is empty and nothing has touched it
    /// for `ttl`.
    pub fn is_idle(&self, ttl: Duration) -> bool {
        self.queue.is_empty() && self.last_activity.lock().unwrap().elapsed() >= ttl
    }

    pub fn join_state(&self) -> JoinState {
        *self.join_state.lock().unwrap()
    }

    pub fn set_joining(&self) {
        *self.join_state.lock().unwrap() = JoinState::Joining;
    }

    /// Called by the server's reader task when the `JOIN` echo for this
    /// channel arrives.
    pub fn mark_joined(&self) {
        *self.join_state.lock().unwrap() = JoinState::Joined;
        self.join_notify.notify_one();
    }

    /// Called by the server's reader task when a join numeric rejects us.
    pub fn mark_rejected(&self) {
        *self.join_state.lock().unwrap() = JoinState::Rejected;
        self.join_notify.notify_one();
    }

    /// Called by the server's reader task on a `KICK`/`PART` targeting us,
    /// or by the server session when a reconnect invalidates every
    /// channel's join state: the next send must re-`JOIN` before it can
    /// proceed. Notifies a pacer parked in `wait_for_join_resolution` so a
    /// pacer that sent `JOIN` and is waiting on its echo re-enters the
    /// handshake instead of waiting forever on a connection that just
    /// died.
    pub fn mark_parted(&self) {
        *self.join_state.lock().unwrap() = JoinState::NotJoined;
        self.join_notify.notify_one();
    }

    /// Waits for `Joining` to resolve into some other state. `NotJoined`
    /// counts as a resolution too: it means the connection the `JOIN` was
    /// sent on dropped out from under us (`mark_parted`), so the caller
    /// should loop back around and re-attempt the handshake rather than
    /// wait for an echo that will never arrive.
    ///
    /// Uses `Notify::notify_one`'s permit, the same pattern `Queue::pop`
    /// uses: a notification sent between our state check and the
    /// `.await` is still observed, because `notify_one` stores a permit
    /// for the next waiter instead of only waking whoever is already
    /// parked.
    async fn wait_for_join_resolution(&self) -> JoinState {
        loop {
            let notified = self.join_notify.notified();
            match self.join_state() {
                JoinState::Joined | JoinState::Rejected | JoinState::NotJoined => {
                    return self.join_state();
                }
                JoinState::Joining => {}
            }
            notified.await;
        }
    }
}

/// Token-bucket pacer implementing "burst of N, then 1 per gap".
///
/// Uses `tokio::time::Instant` rather than `std::time::Instant` so the
/// refill arithmetic tracks the same (possibly paused/virtual) clock that
/// `tokio::time::sleep` advances in tests.
struct Pacer {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: tokio::time::Instant,
}

impl Pacer {
    fn new(burst: usize, gap: Duration) -> Self {
        let rate_per_sec = 1.0 / gap.as_secs_f64().max(f64::EPSILON);
        Self {
            tokens: burst.max(1) as f64,
            capacity: burst.max(1) as f64,
            rate_per_sec,
            last_refill: tokio::time::Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let deficit = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate_per_sec);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Drive one channel session to completion: join on demand, pace and emit
/// queued lines, and exit (removing itself from the server's channel map)
/// on rejection or idle eviction.
///
/// Exits when either the queue goes idle for `tunables.channel_ttl` or the
/// join is permanently rejected. The server session is responsible for
/// re-spawning this task if a later `submit` recreates the channel.
pub async fn run(session: Arc<ChannelSession>, server: Arc<ServerHandle>, tunables: Tunables) {
    let mut pacer = Pacer::new(tunables.burst, tunables.anti_flood_gap);

    loop {
        let idle_check = tokio::time::sleep(tunables.channel_ttl / 4);
        tokio::select! {
            line = session.queue.pop() => {
                if !ensure_joined(&session, &server).await {
                    // Join was rejected, or the server gave up for good;
                    // either way the queue has already been flushed.
                    break;
                }
                pacer.acquire().await;
                server.write_line(wire::privmsg(&session.name, &line));
            }
            _ = idle_check => {
                if session.is_idle(tunables.channel_ttl) {
                    info!(channel = %session.name, server = %server.key, "evicting idle channel");
                    server.write_line(wire::part(&session.name));
                    break;
                }
            }
        }
    }

    server.remove_channel(&session.name);
}

/// Ensure `session` is joined before sending, blocking the pacer until the
/// join resolves. Returns `false` (with the queue already flushed) if the
/// join was rejected, or if the server session terminated for good before
/// it could complete.
async fn ensure_joined(session: &Arc<ChannelSession>, server: &Arc<ServerHandle>) -> bool {
    loop {
        match session.join_state() {
            JoinState::Joined => return true,
            JoinState::Rejected => {
                let dropped = session.queue.drain();
                warn!(
                    channel = %session.name,
                    dropped,
                    "channel join rejected, flushing queue and tearing down session"
                );
                return false;
            }
            JoinState::Joining => {
                session.wait_for_join_resolution().await;
            }
            JoinState::NotJoined => {
                if !server.wait_ready().await {
                    let dropped = session.queue.drain();
                    warn!(
                        channel = %session.name,
                        dropped,
                        "server session terminated before channel could join, flushing queue and tearing down session"
                    );
                    return false;
                }
                session.set_joining();
                debug!(channel = %session.name, "joining channel");
                server.write_line(wire::join(&session.name, session.key.as_deref()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let q = Queue::new(2);
        q.push("a".to_string());
        q.push("b".to_string());
        q.push("c".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.overflow.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn queue_preserves_fifo_order() {
        let q = Queue::new(8);
        for i in 0..5 {
            q.push(i.to_string());
        }
        for i in 0..5 {
            assert_eq!(q.pop().await, i.to_string());
        }
    }

    #[tokio::test]
    async fn idle_requires_both_empty_queue_and_elapsed_ttl() {
        let session = ChannelSession::new("#chan".to_string(), None, 8);
        assert!(!session.is_idle(Duration::from_secs(0)));
        session.enqueue("hi".to_string());
        assert!(!session.is_idle(Duration::from_secs(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_enforces_gap_after_burst() {
        let mut pacer = Pacer::new(2, Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        pacer.acquire().await; // burst token 1
        pacer.acquire().await; // burst token 2
        pacer.acquire().await; // must wait ~1 gap
        assert!(tokio::time::Instant::now() - start >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn join_state_transitions() {
        let session = ChannelSession::new("#chan".to_string(), None, 8);
        assert_eq!(session.join_state(), JoinState::NotJoined);
        session.set_joining();
        assert_eq!(session.join_state(), JoinState::Joining);
        session.mark_joined();
        assert_eq!(session.join_state(), JoinState::Joined);
        session.mark_parted();
        assert_eq!(session.join_state(), JoinState::NotJoined);
    }

    /// Regression test: a reconnect that calls `mark_parted` while a pacer
    /// is parked in `wait_for_join_resolution` (JOIN sent, no echo yet)
    /// must wake that waiter instead of leaving it blocked forever on an
    /// echo that will never arrive on the dead connection.
    #[tokio::test]
    async fn mark_parted_wakes_a_pacer_waiting_on_the_join_echo() {
        let session = ChannelSession::new("#chan".to_string(), None, 8);
        session.set_joining();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_join_resolution().await })
        };
        tokio::task::yield_now().await;

        session.mark_parted();

        let resolved = waiter.await.unwrap();
        assert_eq!(resolved, JoinState::NotJoined);
    }
}
