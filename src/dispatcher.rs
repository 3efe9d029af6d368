//! Dispatcher: the set of live server sessions, keyed by [`ServerKey`],
//! plus the background sweep that evicts sessions sitting idle with no
//! channels (§4.2 of the design doc).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::config::Tunables;
use crate::server::{self, ServerHandle};
use crate::target::{ServerKey, Target};

/// Owns every server session for the process's lifetime. One dispatcher
/// per daemon instance; tests construct their own so state never leaks
/// between them.
pub struct Dispatcher {
    servers: Mutex<HashMap<ServerKey, Arc<ServerHandle>>>,
    default_nick: String,
    tunables: Tunables,
}

impl Dispatcher {
    pub fn new(default_nick: String, tunables: Tunables) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
            default_nick,
            tunables,
        })
    }

    /// Enqueue-only: routes `line` to the channel session for `target`,
    /// lazily spawning the server session and/or channel session if
    /// neither exists yet. Never waits on network I/O.
    pub fn submit(self: &Arc<Self>, target: &Target, line: String) {
        let key = target.server_key(&self.default_nick);
        let server = self.get_or_create_server(key);
        let channel = server.get_or_create_channel(&target.channel, target.key.as_deref());
        channel.enqueue(line);
    }

    fn get_or_create_server(self: &Arc<Self>, key: ServerKey) -> Arc<ServerHandle> {
        let mut servers = self.servers.lock().unwrap();
        if let Some(existing) = servers.get(&key) {
            return existing.clone();
        }
        info!(server = %key, "spawning new server session");
        let (handle, task) = server::spawn(key.clone(), self.tunables);
        servers.insert(key.clone(), handle.clone());
        drop(servers);

        // Once the background task exits for good (evicted, or gave up
        // after MAX_RECONNECTS) its handle is a dead end: remove it from
        // the map so a later submit for this key spawns a fresh session
        // instead of silently black-holing lines on a zombie one.
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let _ = task.await;
            dispatcher.reap_server(&key);
        });

        handle
    }

    fn reap_server(&self, key: &ServerKey) {
        if self.servers.lock().unwrap().remove(key).is_some() {
            info!(server = %key, "removed terminated server session from the dispatcher");
        }
    }

    /// Background task: periodically evict server sessions whose channel
    /// map has been empty for `SERVER_TTL`. Runs until the dispatcher
    /// itself is dropped (in practice, for the life of the process).
    pub async fn run_sweeper(self: Arc<Self>) {
        let period = (self.tunables.server_ttl / 4).max(Duration::from_secs(1));
        loop {
            tokio::time::sleep(period).await;
            self.sweep_idle_servers();
        }
    }

    fn sweep_idle_servers(&self) {
        let mut servers = self.servers.lock().unwrap();
        let idle: Vec<ServerKey> = servers
            .iter()
            .filter(|(_, handle)| handle.idle_for(self.tunables.server_ttl))
            .map(|(key, _)| key.clone())
            .collect();
        for key in idle {
            if let Some(handle) = servers.remove(&key) {
                info!(server = %key, "evicting idle server session");
                handle.request_close();
            }
        }
    }

    /// Cooperative shutdown: ask every live server session to QUIT and
    /// close, then give them up to `SHUTDOWN_GRACE` to actually do so.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<ServerHandle>> = self.servers.lock().unwrap().values().cloned().collect();
        for handle in &handles {
            handle.request_close();
        }
        tokio::time::sleep(self.tunables.shutdown_grace).await;
    }

    #[cfg(test)]
    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_creates_server_and_channel_lazily() {
        let dispatcher = Dispatcher::new("testbot".to_string(), Tunables::default());
        assert_eq!(dispatcher.server_count(), 0);
        // Use an address nothing listens on; the connect attempt runs in
        // the background and doesn't block submit().
        let target: Target = "irc://127.0.0.1:1/#chan".parse().unwrap();
        dispatcher.submit(&target, "hello".to_string());
        assert_eq!(dispatcher.server_count(), 1);
    }

    #[tokio::test]
    async fn same_server_key_shares_one_session() {
        let dispatcher = Dispatcher::new("testbot".to_string(), Tunables::default());
        let a: Target = "irc://127.0.0.1:1/#a".parse().unwrap();
        let b: Target = "irc://127.0.0.1:1/#b".parse().unwrap();
        dispatcher.submit(&a, "x".to_string());
        dispatcher.submit(&b, "y".to_string());
        assert_eq!(dispatcher.server_count(), 1);
    }

    #[tokio::test]
    async fn differing_nick_gets_a_separate_session() {
        let dispatcher = Dispatcher::new("testbot".to_string(), Tunables::default());
        let a: Target = "irc://127.0.0.1:1/#a?nick=one".parse().unwrap();
        let b: Target = "irc://127.0.0.1:1/#a?nick=two".parse().unwrap();
        dispatcher.submit(&a, "x".to_string());
        dispatcher.submit(&b, "y".to_string());
        assert_eq!(dispatcher.server_count(), 2);
    }

    #[tokio::test]
    async fn reap_server_removes_a_known_key_and_ignores_an_unknown_one() {
        let dispatcher = Dispatcher::new("testbot".to_string(), Tunables::default());
        let target: Target = "irc://127.0.0.1:1/#chan".parse().unwrap();
        dispatcher.submit(&target, "hello".to_string());
        assert_eq!(dispatcher.server_count(), 1);

        let key = target.server_key("testbot");
        dispatcher.reap_server(&key);
        assert_eq!(dispatcher.server_count(), 0);

        // Reaping a key that isn't (or is no longer) in the map is a no-op.
        dispatcher.reap_server(&key);
        assert_eq!(dispatcher.server_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_reconnects_evicts_the_server_session() {
        let tunables = Tunables {
            reconnect_base: Duration::from_millis(5),
            reconnect_cap: Duration::from_millis(15),
            max_reconnects: 2,
            ..Tunables::default()
        };
        let dispatcher = Dispatcher::new("testbot".to_string(), tunables);
        // Nothing listens here: every connect attempt fails immediately,
        // so the background task gives up after two failures.
        let target: Target = "irc://127.0.0.1:1/#a".parse().unwrap();
        dispatcher.submit(&target, "hello".to_string());
        assert_eq!(dispatcher.server_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.server_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("the dispatcher should reap the server once MAX_RECONNECTS is exhausted");
    }
}
