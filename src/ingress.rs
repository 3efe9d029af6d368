//! Ingress: local transport listeners that accept JSON request objects
//! and hand them to the [`Dispatcher`] (§4.1 of the design doc).
//!
//! Each accepted connection is read incrementally and fed through
//! [`serde_json`]'s streaming deserializer, which tolerates whitespace
//! between objects and lets us tell "not enough bytes yet" apart from
//! "this is not valid JSON" — the former just waits for more reads, the
//! latter closes the connection per §4.1.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::DaemonError;
use crate::request::{expand_privmsg, Request};

/// Bind the TCP ingress listener and, if `unix_path` is set, a UNIX-domain
/// listener too (additive, per §6). Returns once both listeners are bound;
/// the accept loops themselves run as background tasks for the life of the
/// process.
pub async fn serve(
    dispatcher: Arc<Dispatcher>,
    bind_addr: std::net::IpAddr,
    port: u16,
    unix_path: Option<std::path::PathBuf>,
) -> Result<(), DaemonError> {
    let tcp_addr = std::net::SocketAddr::new(bind_addr, port);
    let tcp_listener = TcpListener::bind(tcp_addr)
        .await
        .map_err(|source| DaemonError::IngressBind {
            addr: tcp_addr.to_string(),
            source,
        })?;
    info!(addr = %tcp_addr, "ingress listening");

    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            accept_loop_tcp(tcp_listener, dispatcher).await;
        });
    }

    if let Some(path) = unix_path {
        // A stale socket file from a previous run would make bind fail
        // with AddrInUse; best-effort remove it first.
        let _ = std::fs::remove_file(&path);
        let unix_listener =
            UnixListener::bind(&path).map_err(|source| DaemonError::UnixBind {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = %path.display(), "ingress listening (unix)");
        tokio::spawn(async move {
            accept_loop_unix(unix_listener, dispatcher).await;
        });
    }

    Ok(())
}

async fn accept_loop_tcp(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "ingress connection accepted");
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { handle_connection(stream, dispatcher).await });
            }
            Err(e) => {
                warn!(error = %e, "ingress accept failed");
            }
        }
    }
}

async fn accept_loop_unix(listener: UnixListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("ingress connection accepted (unix)");
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { handle_connection(stream, dispatcher).await });
            }
            Err(e) => {
                warn!(error = %e, "ingress accept failed (unix)");
            }
        }
    }
}

/// Drain one producer connection to completion: parse every complete JSON
/// object as it becomes available, dispatch it, and keep going until EOF
/// or a malformed object closes the connection.
async fn handle_connection(mut stream: impl tokio::io::AsyncRead + Unpin, dispatcher: Arc<Dispatcher>) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "ingress connection read error");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match take_one_object(&buf) {
                TakeResult::Object(request, consumed) => {
                    buf.drain(..consumed);
                    dispatch_request(&dispatcher, request);
                }
                TakeResult::NeedMoreData => break,
                TakeResult::Malformed(e) => {
                    warn!(error = %e, "malformed JSON on ingress connection, closing");
                    return;
                }
            }
        }
    }

    if !buf.iter().all(u8::is_ascii_whitespace) {
        debug!("ingress connection closed with an incomplete trailing object");
    }
}

enum TakeResult {
    Object(Request, usize),
    NeedMoreData,
    Malformed(serde_json::Error),
}

/// Try to parse exactly one `Request` object from the front of `buf`.
fn take_one_object(buf: &[u8]) -> TakeResult {
    let mut de = serde_json::Deserializer::from_slice(buf).into_iter::<Request>();
    match de.next() {
        None => TakeResult::NeedMoreData,
        Some(Ok(request)) => TakeResult::Object(request, de.byte_offset()),
        Some(Err(e)) if e.is_eof() => TakeResult::NeedMoreData,
        Some(Err(e)) => TakeResult::Malformed(e),
    }
}

fn dispatch_request(dispatcher: &Arc<Dispatcher>, request: Request) {
    let targets = match request.targets() {
        Ok(targets) => targets,
        Err(e) => {
            warn!(error = %e, "dropping request with invalid target");
            return;
        }
    };
    for target in targets {
        let lines = expand_privmsg(&request.privmsg, &target.channel);
        for line in lines {
            dispatcher.submit(&target, line);
        }
    }
}
