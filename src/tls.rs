//! TLS transport for `ircs://` targets.
//!
//! Certificate validation is always strict: the client trusts the Mozilla
//! root set shipped by `webpki-roots` and nothing else. There is
//! deliberately no "accept any certificate" escape hatch — see DESIGN.md.

use std::sync::{Arc, Once};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::DaemonError;

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        // Ignore the error: it only fails if a provider was already
        // installed by another part of the process, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build a client TLS configuration trusting the bundled Mozilla root set.
pub fn client_config() -> Result<Arc<ClientConfig>, DaemonError> {
    ensure_crypto_provider();

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Perform the client-side TLS handshake over an already-connected TCP
/// stream, validating `host` against the peer certificate.
pub async fn connect(
    stream: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> std::io::Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    TlsConnector::from(config).connect(server_name, stream).await
}
