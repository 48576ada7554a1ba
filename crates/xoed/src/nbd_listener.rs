//! Dedicated listener for native NBD clients (spec §4.F).
//!
//! Native NBD traffic never reaches [`crate::dispatcher`] — it speaks the
//! standard NBD wire format directly on its own TCP connection, so it gets
//! its own accept loop and its own thread per session, mirroring the
//! dispatcher's thread-per-connection model but without the XOE envelope
//! or TLS in the loop.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use xoe_services::backend::BlockBackend;
use xoe_services::nbd_session::NbdSession;

/// Bind `addr` and run native NBD sessions, one thread per accepted
/// connection, until `shutdown` is observed.
pub fn run(addr: SocketAddr, backend: Arc<dyn BlockBackend>, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!(%addr, "NBD listener bound");

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((socket, peer_addr)) => {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    debug!(peer = %peer_addr, "NBD session starting");
                    let mut session = NbdSession::new(socket, backend, "default");
                    if let Err(e) = session.run() {
                        warn!(peer = %peer_addr, error = %e, "NBD session ended with error");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => warn!(error = %e, "NBD accept failed"),
        }
    }
    Ok(())
}
