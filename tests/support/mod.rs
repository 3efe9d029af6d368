//! Shared fake-IRC-server helpers for the end-to-end scenarios in §8 of
//! the design doc. Not a test module itself — `mod support;` pulls it in.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// A loopback listener standing in for an IRC server the daemon connects
/// out to.
pub async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// One accepted connection from the daemon, with line-at-a-time helpers
/// for driving the registration/join/privmsg protocol in tests.
pub struct FakeClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeClient {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("timed out waiting for the daemon to connect")
            .unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read one CRLF-terminated line and assert it starts with `prefix`.
    /// Returns the full line (with the trailing CRLF stripped).
    pub async fn expect_line_starting_with(&mut self, prefix: &str) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for a line starting with {prefix:?}"))
            .unwrap();
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        assert!(
            trimmed.starts_with(prefix),
            "expected a line starting with {prefix:?}, got {trimmed:?}"
        );
        trimmed
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    /// Close the connection, simulating the remote IRC server vanishing.
    pub async fn hang_up(self) {
        drop(self);
    }
}
