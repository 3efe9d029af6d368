//! Server session: one TCP/TLS connection to one IRC server, its
//! registration handshake, PING/PONG liveness, and reconnect/backoff
//! (§4.3 of the design doc).
//!
//! A [`ServerHandle`] is the shared, `Arc`-held front door every other part
//! of the daemon talks to: the dispatcher looks sessions up by
//! [`ServerKey`], channel sessions enqueue outbound lines and wait for
//! `READY`, and the idle sweep asks whether a session has been
//! channel-less long enough to evict. The connection itself — reconnect
//! loop, reader, writer, liveness timer — runs in a background task owned
//! by [`spawn`].

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, trace, warn};

use crate::channel::{self, ChannelSession};
use crate::config::Tunables;
use crate::target::ServerKey;
use crate::wire;

/// Registration state machine (§4.3). `Closing` is folded into
/// `Disconnected` here: nothing outside this module distinguishes "about
/// to close" from "closed", since both mean "not usable yet". `Terminated`
/// is a true dead end reached once the background task has given up for
/// good (evicted, or `MAX_RECONNECTS` exhausted) and will never attempt
/// another connection — it's what lets a channel pacer parked in
/// `wait_ready` tell "still trying" apart from "never coming back".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Registering,
    Ready,
    Terminated,
}

/// One of the two transports a [`Target`](crate::target::Target) can
/// resolve to. Implements `AsyncRead`/`AsyncWrite` by delegation so the
/// reader/writer loops don't need to care which one they got.
enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

async fn connect(key: &ServerKey) -> io::Result<Conn> {
    let tcp = TcpStream::connect((key.host.as_str(), key.port)).await?;
    tcp.set_nodelay(true)?;
    if !key.tls {
        return Ok(Conn::Plain(tcp));
    }
    let config = crate::tls::client_config()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let tls = crate::tls::connect(tcp, &key.host, config).await?;
    Ok(Conn::Tls(Box::new(tls)))
}

/// Shared handle for one server key. Cheap to clone (it's just an `Arc`);
/// every channel session and the dispatcher hold one.
pub struct ServerHandle {
    pub key: ServerKey,
    tunables: Tunables,
    state_tx: watch::Sender<ServerState>,
    state_rx: watch::Receiver<ServerState>,
    outbound: mpsc::UnboundedSender<String>,
    channels: Mutex<HashMap<String, Arc<ChannelSession>>>,
    nick: Mutex<String>,
    empty_since: Mutex<Option<Instant>>,
    close_requested: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl ServerHandle {
    fn new(key: ServerKey, tunables: Tunables, outbound: mpsc::UnboundedSender<String>) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ServerState::Disconnected);
        let nick = key.nick.clone();
        Arc::new(Self {
            key,
            tunables,
            state_tx,
            state_rx,
            outbound,
            channels: Mutex::new(HashMap::new()),
            nick: Mutex::new(nick),
            empty_since: Mutex::new(Some(Instant::now())),
            close_requested: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn set_state(&self, state: ServerState) {
        let _ = self.state_tx.send(state);
    }

    pub fn state(&self) -> ServerState {
        *self.state_rx.borrow()
    }

    /// Block until the session reaches `READY`. Returns `false` instead of
    /// hanging forever if the session reaches `Terminated` (or its `watch`
    /// sender is dropped) first — the caller should give up rather than
    /// wait on a connection that will never come back.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow() {
                ServerState::Ready => return true,
                ServerState::Terminated => return false,
                _ => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Enqueue a raw line for the writer task. Never blocks: the outbound
    /// channel is unbounded because it only ever carries protocol control
    /// lines and already-paced `PRIVMSG`s, never producer-controlled
    /// volume directly.
    pub fn write_line(&self, line: String) {
        let _ = self.outbound.send(line);
    }

    /// Get the channel session for `name`, creating (and spawning its
    /// pacer task) if this is the first time it's been asked for.
    pub fn get_or_create_channel(
        self: &Arc<Self>,
        name: &str,
        key: Option<&str>,
    ) -> Arc<ChannelSession> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(existing) = channels.get(name) {
            return existing.clone();
        }
        let session = ChannelSession::new(name.to_string(), key.map(str::to_string), self.tunables.queue_max);
        channels.insert(name.to_string(), session.clone());
        *self.empty_since.lock().unwrap() = None;
        tokio::spawn(channel::run(session.clone(), self.clone(), self.tunables));
        session
    }

    fn find_channel(&self, name: &str) -> Option<Arc<ChannelSession>> {
        self.channels.lock().unwrap().get(name).cloned()
    }

    /// Called by a channel session's pacer task when it exits (idle
    /// eviction or join rejection).
    pub fn remove_channel(&self, name: &str) {
        let mut channels = self.channels.lock().unwrap();
        channels.remove(name);
        if channels.is_empty() {
            *self.empty_since.lock().unwrap() = Some(Instant::now());
        }
    }

    /// `true` once every channel has been gone for at least `ttl` — the
    /// dispatcher's sweep uses this to decide whether to evict us.
    pub fn idle_for(&self, ttl: Duration) -> bool {
        match *self.empty_since.lock().unwrap() {
            Some(since) => since.elapsed() >= ttl,
            None => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// A new connection invalidates every channel's join state: whatever
    /// they thought they were joined to lived on the socket that just
    /// died. The next send on each will re-`JOIN` before proceeding.
    fn reset_channels_for_reconnect(&self) {
        for session in self.channels.lock().unwrap().values() {
            session.mark_parted();
        }
    }

    fn current_nick(&self) -> String {
        self.nick.lock().unwrap().clone()
    }

    /// `433` (nick in use) handling: append/increment a numeric suffix.
    fn bump_nick(&self) -> String {
        let mut nick = self.nick.lock().unwrap();
        let (base, n) = split_trailing_digits(&nick);
        *nick = format!("{base}{}", n + 1);
        nick.clone()
    }

    /// Request cooperative shutdown: QUIT is sent, the socket is closed,
    /// and the background task exits instead of reconnecting.
    pub fn request_close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.close_requested.notify_waiters();
    }

    fn close_was_requested(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

fn split_trailing_digits(nick: &str) -> (&str, u32) {
    let digit_start = nick
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    if digit_start == nick.len() {
        (nick, 0)
    } else {
        let n: u32 = nick[digit_start..].parse().unwrap_or(0);
        (&nick[..digit_start], n)
    }
}

/// Spawn the background task that owns one server key's connection
/// lifecycle: connect, register, run reader/writer/liveness until the
/// connection drops, then reconnect with backoff — forever, until
/// `MAX_RECONNECTS` consecutive failures or a cooperative close.
///
/// Returns the handle other components submit work to, plus the
/// background task's `JoinHandle`. The caller (the dispatcher) is
/// responsible for removing the key from its map once that task exits —
/// it sets the handle's state to `Terminated` before returning, so a
/// caller awaiting the `JoinHandle` can treat its completion as the
/// removal signal.
pub fn spawn(key: ServerKey, tunables: Tunables) -> (Arc<ServerHandle>, tokio::task::JoinHandle<()>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = ServerHandle::new(key, tunables, outbound_tx);
    let task = tokio::spawn(run(handle.clone(), outbound_rx));
    (handle, task)
}

async fn run(handle: Arc<ServerHandle>, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
    let mut attempt: u32 = 0;

    loop {
        if handle.close_was_requested() {
            break;
        }

        if attempt > 0 {
            let backoff = backoff_delay(attempt, handle.tunables.reconnect_base, handle.tunables.reconnect_cap);
            info!(server = %handle.key, attempt, delay = ?backoff, "waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = handle.close_requested.notified() => break,
            }
        }

        handle.set_state(ServerState::Connecting);
        debug!(server = %handle.key, "connecting");
        let conn = tokio::select! {
            result = connect(&handle.key) => result,
            _ = handle.close_requested.notified() => break,
        };

        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                warn!(server = %handle.key, error = %e, attempt, "connect failed");
                attempt += 1;
                if attempt >= handle.tunables.max_reconnects {
                    warn!(server = %handle.key, "giving up after too many reconnect failures");
                    break;
                }
                continue;
            }
        };

        let became_ready_for_a_minute = run_session(&handle, conn, &mut outbound_rx).await;
        handle.set_state(ServerState::Disconnected);

        if handle.close_was_requested() {
            break;
        }
        // A fresh connection means every channel needs a fresh JOIN,
        // regardless of what it thought its join state was on the
        // connection that just died.
        handle.reset_channels_for_reconnect();
        if became_ready_for_a_minute {
            attempt = 0;
        } else {
            attempt += 1;
        }
        if attempt >= handle.tunables.max_reconnects {
            warn!(server = %handle.key, "giving up after too many reconnect failures");
            break;
        }
        if handle.channel_count() == 0 {
            // Nothing left to reconnect for; let the dispatcher's idle
            // sweep evict us on its own schedule instead of spinning.
            continue;
        }
    }

    // Mark the session dead before draining so any pacer still parked in
    // `wait_ready`/`wait_for_join_resolution` (e.g. a channel that was
    // `Joining` when the last reconnect attempt gave up) wakes up and
    // tears itself down instead of leaking forever.
    handle.set_state(ServerState::Terminated);
    handle.reset_channels_for_reconnect();
    for (name, session) in handle.channels.lock().unwrap().drain() {
        let dropped = session.queue_len();
        debug!(server = %handle.key, channel = %name, dropped, "dropping channel on server eviction");
    }
    info!(server = %handle.key, "server session terminated");
}

/// Run one TCP connection end to end: register, then pump the reader,
/// writer, and PING liveness loops until something ends the connection.
///
/// Returns whether the session stayed `READY` for a full uninterrupted
/// minute, which resets the reconnect backoff counter per §4.3.
async fn run_session(
    handle: &Arc<ServerHandle>,
    conn: Conn,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> bool {
    let (read_half, mut write_half) = tokio::io::split(conn);
    let mut reader = BufReader::new(read_half);

    handle.set_state(ServerState::Registering);
    let nick = handle.current_nick();
    if let Err(e) = write_half.write_all(wire::nick(&nick).as_bytes()).await {
        warn!(server = %handle.key, error = %e, "write failed during registration");
        return false;
    }
    let username = std::env::var("USER").unwrap_or_else(|_| "irkerd".to_string());
    if write_half
        .write_all(wire::user(&username, "irkerd relay").as_bytes())
        .await
        .is_err()
    {
        return false;
    }

    let ready_since = Mutex::new(None::<Instant>);
    let mut line_buf = String::new();
    let mut last_traffic = Instant::now();
    let mut ping_token: Option<String> = None;

    loop {
        let idle_deadline = tokio::time::sleep_until(
            last_traffic
                + if ping_token.is_some() {
                    handle.tunables.ping_timeout
                } else {
                    handle.tunables.ping_interval
                },
        );

        tokio::select! {
            biased;

            _ = handle.close_requested.notified() => {
                let _ = write_half.write_all(wire::quit("shutting down").as_bytes()).await;
                return stayed_ready_a_minute(&ready_since);
            }

            line = outbound_rx.recv() => {
                match line {
                    Some(line) => {
                        trace!(server = %handle.key, line = %redact(&line), "-> ");
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            return stayed_ready_a_minute(&ready_since);
                        }
                    }
                    None => return stayed_ready_a_minute(&ready_since), // dispatcher dropped the sender
                }
            }

            n = reader.read_line(&mut line_buf) => {
                match n {
                    Ok(0) => {
                        info!(server = %handle.key, "connection closed by peer");
                        return stayed_ready_a_minute(&ready_since);
                    }
                    Ok(_) => {
                        last_traffic = Instant::now();
                        ping_token = None;
                        let raw = std::mem::take(&mut line_buf);
                        trace!(server = %handle.key, line = %raw.trim_end(), "<- ");
                        if let Some(parsed) = wire::parse_line(&raw) {
                            if !handle_incoming(handle, &parsed, &mut write_half, &ready_since).await {
                                return stayed_ready_a_minute(&ready_since);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(server = %handle.key, error = %e, "read error");
                        return stayed_ready_a_minute(&ready_since);
                    }
                }
            }

            _ = idle_deadline => {
                if ping_token.is_some() {
                    warn!(server = %handle.key, "PING timeout, forcing disconnect");
                    return stayed_ready_a_minute(&ready_since);
                }
                let token = format!("irkerd-{}", rand::thread_rng().gen::<u32>());
                if write_half.write_all(wire::ping(&token).as_bytes()).await.is_err() {
                    return stayed_ready_a_minute(&ready_since);
                }
                ping_token = Some(token);
            }
        }
    }
}

fn stayed_ready_a_minute(ready_since: &Mutex<Option<Instant>>) -> bool {
    matches!(*ready_since.lock().unwrap(), Some(since) if since.elapsed() >= Duration::from_secs(60))
}

/// Process one parsed line from the server. Returns `false` if the
/// connection should be torn down (fatal `ERROR`).
async fn handle_incoming<W: AsyncWrite + Unpin>(
    handle: &Arc<ServerHandle>,
    line: &wire::Line,
    write_half: &mut W,
    ready_since: &Mutex<Option<Instant>>,
) -> bool {
    match line.command.as_str() {
        "PING" => {
            if let Some(token) = line.param(0) {
                let _ = write_half.write_all(wire::pong(token).as_bytes()).await;
            }
            true
        }
        "001" => {
            handle.set_state(ServerState::Ready);
            *ready_since.lock().unwrap() = Some(Instant::now());
            info!(server = %handle.key, "registered");
            true
        }
        "433" if handle.state() == ServerState::Registering => {
            let nick = handle.bump_nick();
            debug!(server = %handle.key, nick = %nick, "nick in use, retrying");
            let _ = write_half.write_all(wire::nick(&nick).as_bytes()).await;
            true
        }
        "403" | "437" | "471" | "473" | "474" | "475" => {
            if let Some(channel) = line.param(1) {
                if let Some(session) = handle.find_channel(channel) {
                    warn!(server = %handle.key, channel, numeric = %line.command, "channel join rejected");
                    session.mark_rejected();
                }
            }
            true
        }
        "JOIN" => {
            if line.prefix_nick() == Some(handle.current_nick().as_str()) {
                if let Some(channel) = line.param(0) {
                    if let Some(session) = handle.find_channel(channel) {
                        session.mark_joined();
                    }
                }
            }
            true
        }
        "KICK" => {
            if line.param(1) == Some(handle.current_nick().as_str()) {
                if let Some(channel) = line.param(0) {
                    if let Some(session) = handle.find_channel(channel) {
                        warn!(server = %handle.key, channel, "kicked, will rejoin on next send");
                        session.mark_parted();
                    }
                }
            }
            true
        }
        "PART" => {
            if line.prefix_nick() == Some(handle.current_nick().as_str()) {
                if let Some(channel) = line.param(0) {
                    if let Some(session) = handle.find_channel(channel) {
                        session.mark_parted();
                    }
                }
            }
            true
        }
        "ERROR" => {
            warn!(server = %handle.key, message = ?line.param(0), "server sent ERROR");
            false
        }
        _ => true,
    }
}

/// Redact a `JOIN`'s channel key before it hits a level-2 protocol trace
/// log line, per §4.6's "sensitive tokens such as channel keys redacted".
fn redact(line: &str) -> String {
    let trimmed = line.trim_end();
    if let Some(rest) = trimmed.strip_prefix("JOIN ") {
        if let Some((channel, _key)) = rest.split_once(' ') {
            return format!("JOIN {channel} ***");
        }
    }
    trimmed.to_string()
}

fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi((attempt - 1) as i32);
    let capped = exp.min(cap.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((capped * jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_suffix_increments() {
        assert_eq!(split_trailing_digits("bot"), ("bot", 0));
        assert_eq!(split_trailing_digits("bot1"), ("bot", 1));
        assert_eq!(split_trailing_digits("bot42"), ("bot", 42));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30 * 60);
        // Even with jitter's widest swing (0.5x), attempt 1 should be at
        // least base * 0.5, and a huge attempt count should never exceed
        // cap * 1.5.
        let d1 = backoff_delay(1, base, cap);
        assert!(d1 >= Duration::from_secs(1) && d1 <= Duration::from_secs(3));

        let d_big = backoff_delay(30, base, cap);
        assert!(d_big <= Duration::from_secs_f64(cap.as_secs_f64() * 1.5));
    }

    #[test]
    fn redacts_join_key() {
        assert_eq!(redact("JOIN #chan secretkey\r\n"), "JOIN #chan ***");
        assert_eq!(redact("JOIN #chan\r\n"), "JOIN #chan");
        assert_eq!(redact("PRIVMSG #chan :hello\r\n"), "PRIVMSG #chan :hello");
    }

    fn test_handle() -> Arc<ServerHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = ServerKey {
            tls: false,
            host: "host".to_string(),
            port: 1,
            nick: "nick".to_string(),
        };
        ServerHandle::new(key, Tunables::default(), tx)
    }

    #[tokio::test]
    async fn wait_ready_resolves_true_once_the_state_reaches_ready() {
        let handle = test_handle();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        tokio::task::yield_now().await;
        handle.set_state(ServerState::Ready);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_ready_resolves_false_once_the_state_is_terminated() {
        let handle = test_handle();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_ready().await })
        };
        tokio::task::yield_now().await;
        handle.set_state(ServerState::Terminated);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_ready_returns_false_immediately_if_already_terminated() {
        let handle = test_handle();
        handle.set_state(ServerState::Terminated);
        assert!(!handle.wait_ready().await);
    }
}
