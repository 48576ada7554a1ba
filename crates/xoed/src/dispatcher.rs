//! Component K — the per-connection protocol dispatcher.
//!
//! One OS thread per accepted connection, detached, spawned by
//! [`crate::server::Server::run`]. The dispatcher owns nothing shared with
//! its peers other than the [`UsbRouter`] registry and the [`ConnectionPool`]
//! slot it occupies — everything else is local to the thread.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use tracing::{info, warn};

use xoe_core::envelope::{self, ProtocolId};
use xoe_core::XoeError;

use crate::pool::ConnectionPool;
use crate::usb_router::UsbRouter;

/// Which transport a connection arrived on. The dispatcher is generic over
/// `Read + Write` so plain TCP and the TLS adapter drive the identical loop
/// (spec §4.B: "differences are confined to the underlying read/write
/// call").
pub struct Dispatcher<S> {
    stream: S,
    peer_addr: SocketAddr,
    usb_router: Arc<UsbRouter>,
}

impl<S: Read + Write> Dispatcher<S> {
    pub fn new(stream: S, peer_addr: SocketAddr, usb_router: Arc<UsbRouter>) -> Self {
        Self {
            stream,
            peer_addr,
            usb_router,
        }
    }

    /// Run the receive loop until EOF or an unrecoverable stream error.
    /// `raw_stream` is the underlying `TcpStream` the USB router uses to
    /// register this connection for routed sends — it's the same socket
    /// `stream` wraps (directly, or through TLS).
    pub fn run(&mut self, raw_stream: &TcpStream) {
        loop {
            let packet = match envelope::recv_packet(&mut self.stream) {
                Ok(p) => p,
                Err(XoeError::NetworkError(_)) => {
                    info!(peer = %self.peer_addr, "connection closed");
                    return;
                }
                Err(XoeError::ChecksumMismatch) | Err(XoeError::ProtocolError(_)) => {
                    // Recoverable per spec §7: log and keep reading.
                    warn!(peer = %self.peer_addr, "dropped malformed packet, continuing");
                    continue;
                }
                Err(e) => {
                    warn!(peer = %self.peer_addr, error = %e, "dispatcher stream error, closing connection");
                    return;
                }
            };

            let Ok(protocol_id) = ProtocolId::try_from(packet.protocol_id) else {
                warn!(peer = %self.peer_addr, protocol_id = packet.protocol_id, "unknown protocol_id, continuing");
                continue;
            };

            match protocol_id {
                ProtocolId::Usb => {
                    match self.usb_router.handle_urb(&packet.payload, self.peer_addr, raw_stream) {
                        Ok(Some(reply)) => {
                            if let Err(e) = envelope::send_packet(&mut self.stream, &reply) {
                                warn!(peer = %self.peer_addr, error = %e, "failed to send USB reply, closing connection");
                                return;
                            }
                        }
                        Ok(None) => {
                            // SUBMIT/RET_SUBMIT: routed directly to the peer, no reply here.
                        }
                        Err(e) => {
                            warn!(peer = %self.peer_addr, error = %e, "USB URB handling failed, continuing");
                        }
                    }
                }
                // Legacy behaviour (spec §4.K, §9 open question): protocols the
                // dispatcher does not itself terminate are echoed back unchanged.
                // Native NBD sessions never reach this loop — they run on their
                // own dedicated listener (spec §4.F).
                ProtocolId::Raw | ProtocolId::Serial | ProtocolId::Nbd => {
                    if let Err(e) = envelope::send_packet(&mut self.stream, &packet) {
                        warn!(peer = %self.peer_addr, error = %e, "echo failed, closing connection");
                        return;
                    }
                }
            }
        }
    }
}

/// Accept one connection, drive it through TLS (if configured) and the
/// dispatch loop, then release its pool slot. Spawned as a detached thread
/// per accepted socket by [`crate::server::Server::run`].
pub fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    pool: Arc<ConnectionPool>,
    slot: usize,
    usb_router: Arc<UsbRouter>,
    tls_ctx: Option<Arc<xoe_services::tls::ServerTlsContext>>,
) {
    let raw_stream = match socket.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "failed to clone socket for routing, dropping connection");
            pool.release(slot);
            return;
        }
    };

    match tls_ctx {
        Some(ctx) => match ctx.session_accept(socket) {
            Ok(mut tls_stream) => {
                Dispatcher::new(&mut tls_stream, peer_addr, usb_router.clone()).run(&raw_stream);
                let _ = tls_stream.shutdown();
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "TLS handshake failed, dropping connection");
            }
        },
        None => {
            let mut stream = socket;
            Dispatcher::new(&mut stream, peer_addr, usb_router.clone()).run(&raw_stream);
        }
    }

    // spec §4.K step 4: unregister the socket from the USB routing server
    // before releasing the pool slot, in case the peer disconnected without
    // ever sending CMD_UNREGISTER.
    usb_router.unregister_peer(peer_addr);
    pool.release(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use xoe_core::envelope::Packet;
    use xoe_services::usb_auth::ClassWhitelist;

    fn loopback_pair() -> (TcpStream, SocketAddr, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        let local = client.local_addr().unwrap();
        (client, peer, server_side, local)
    }

    #[test]
    fn raw_packets_are_echoed_back() {
        let (mut client, peer_addr, server_side, _local) = loopback_pair();
        let router = Arc::new(UsbRouter::new(ClassWhitelist::default(), Vec::new()));

        let raw_for_routing = server_side.try_clone().unwrap();
        let handle = std::thread::spawn(move || {
            let mut stream = server_side;
            Dispatcher::new(&mut stream, peer_addr, router).run(&raw_for_routing);
        });

        let packet = Packet::new(ProtocolId::Raw, 1, vec![1, 2, 3]);
        envelope::send_packet(&mut client, &packet).unwrap();
        let echoed = envelope::recv_packet(&mut client).unwrap();
        assert_eq!(echoed.payload, vec![1, 2, 3]);

        drop(client);
        handle.join().unwrap();
    }
}
