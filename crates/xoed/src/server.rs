//! The top-level server object.
//!
//! Design note (spec §9): the original C sources kept `g_tls_ctx`,
//! `g_usb_server`, and the client pool array as process globals. Here they
//! are fields of one `Server` owned by `main`, constructed in the spec's
//! mandated order — config → pool → TLS context → USB server → listening
//! socket — and handed to every worker thread by `Arc` reference rather
//! than reached for as a global.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use xoe_services::tls::{ServerTlsContext, TlsVersion};
use xoe_services::backend::BlockBackend;

use crate::config::{EncryptionMode, XoeConfig};
use crate::dispatcher;
use crate::nbd_listener;
use crate::pool::ConnectionPool;
use crate::usb_router::UsbRouter;

/// How long `shutdown` waits for in-flight connections to drain before
/// force-clearing remaining pool slots (spec §5).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    config: XoeConfig,
    pool: Arc<ConnectionPool>,
    tls_ctx: Option<Arc<ServerTlsContext>>,
    usb_router: Arc<UsbRouter>,
}

impl Server {
    /// Build a server from `config`. TLS context construction happens here
    /// (and can fail loudly) so that a bad cert/key pair is caught before
    /// the listener ever binds.
    pub fn new(config: XoeConfig) -> anyhow::Result<Self> {
        let pool = Arc::new(ConnectionPool::new(crate::pool::MAX_CLIENTS));

        let tls_ctx = match config.tls.encryption_mode {
            EncryptionMode::None => None,
            EncryptionMode::Tls1_2 | EncryptionMode::Tls1_3 => {
                let version = match config.tls.encryption_mode {
                    EncryptionMode::Tls1_2 => TlsVersion::V1_2,
                    _ => TlsVersion::V1_3,
                };
                let cert = config.tls.cert_path.as_ref().expect("validated by XoeConfig::load");
                let key = config.tls.key_path.as_ref().expect("validated by XoeConfig::load");
                let ctx = ServerTlsContext::new(cert, key, version)
                    .map_err(|e| anyhow::anyhow!("TLS context init failed: {e}"))?;
                info!("TLS context initialised");
                Some(Arc::new(ctx))
            }
        };

        let whitelist = xoe_services::usb_auth::ClassWhitelist::new(config.usb.class_whitelist.clone());
        let usb_router = Arc::new(UsbRouter::new(whitelist, config.usb.auth_secret.clone().into_bytes()));

        Ok(Self {
            config,
            pool,
            tls_ctx,
            usb_router,
        })
    }

    /// Bind the listener and run the accept loop until `shutdown` is
    /// signalled (spec §4.K, §5). Blocking; returns once the listener and
    /// every in-flight connection have wound down.
    pub fn run(&self, shutdown: Arc<std::sync::atomic::AtomicBool>) -> anyhow::Result<()> {
        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(bind_addr)?;
        // Periodically re-check the shutdown flag between accepts.
        listener.set_nonblocking(true)?;
        info!(addr = %bind_addr, "listening");

        if let (Some(port), Some(backend)) = (self.config.network.nbd_port, self.nbd_backend()?) {
            let nbd_addr = SocketAddr::new(bind_addr.ip(), port);
            let shutdown_for_nbd = shutdown.clone();
            std::thread::spawn(move || {
                if let Err(e) = nbd_listener::run(nbd_addr, backend, shutdown_for_nbd) {
                    error!(error = %e, "NBD listener exited");
                }
            });
        }

        while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            match listener.accept() {
                Ok((socket, peer_addr)) => self.accept_one(socket, peer_addr),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }

        info!("shutdown signalled, draining connections");
        self.pool.disconnect_all();
        self.pool.wait_for_idle(SHUTDOWN_GRACE);
        Ok(())
    }

    fn accept_one(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let Some(slot) = self.pool.acquire(socket_clone_or_warn(&socket), peer_addr) else {
            // Pool exhaustion (spec §7): accept and immediately close to
            // avoid kernel backlog accumulation, with a rejection log line.
            warn!(peer = %peer_addr, "connection pool full, rejecting");
            let _ = socket.shutdown(std::net::Shutdown::Both);
            return;
        };

        let pool = self.pool.clone();
        let usb_router = self.usb_router.clone();
        let tls_ctx = self.tls_ctx.clone();

        std::thread::spawn(move || {
            dispatcher::handle_connection(socket, peer_addr, pool, slot, usb_router, tls_ctx);
        });
    }

    fn bind_addr(&self) -> SocketAddr {
        let ip = self
            .config
            .network
            .listen_address
            .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.config.network.listen_port)
    }

    /// The NBD listener needs its own backend; server mode opens the first
    /// configured serial device path's sibling convention is out of scope
    /// here (spec §1 excludes concrete serial plumbing) — NBD exports are
    /// driven purely from `XOE_NBD_EXPORT_PATH` until a richer export table
    /// lands in configuration.
    fn nbd_backend(&self) -> anyhow::Result<Option<Arc<dyn BlockBackend>>> {
        match std::env::var("XOE_NBD_EXPORT_PATH") {
            Ok(path) => {
                let read_only = std::env::var("XOE_NBD_READ_ONLY").is_ok();
                let backend = xoe_services::backend::FileBackend::open(&path, read_only, 512)
                    .map_err(|e| anyhow::anyhow!("failed to open NBD export {path}: {e}"))?;
                Ok(Some(Arc::new(backend)))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.pool.active_count()
    }
}

/// `TcpStream::try_clone` only fails under resource exhaustion; treat it as
/// fatal to the accept rather than silently dropping the connection's
/// ability to be tracked.
fn socket_clone_or_warn(socket: &TcpStream) -> TcpStream {
    socket.try_clone().expect("failed to clone accepted socket")
}
