//! Client-mode serial bridge (spec §1 `CLIENT_SERIAL`, §5 thread model).
//!
//! Runs the three-thread pattern spec §5 describes: one producer thread
//! reading the local serial device into the circular buffer, one consumer
//! thread draining the buffer and sending framed packets over the network,
//! and one thread reading framed packets from the network and writing them
//! to the serial port. The concrete `tcsetattr`-level port configuration
//! (baud/parity/data bits/stop bits/flow control) is out of scope (spec
//! §1) — callers provide any [`SerialPort`] implementation; this module
//! only owns the bridging threads and the ring buffer between them.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use xoe_core::envelope::{self, Packet, ProtocolId};
use xoe_core::serial::{self, SerialHeader, SERIAL_MAX_PAYLOAD};
use xoe_services::circular_buffer::CircularBuffer;

/// The backend collaborator a concrete serial port implementation supplies.
/// Mirrors the block-backend-style interface pattern (spec §4.G) applied to
/// serial I/O: the bridge only ever calls `read`/`write`.
pub trait SerialPort: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&self, buf: &[u8]) -> std::io::Result<usize>;
}

/// Capacity of the ring buffer sitting between the serial-read producer and
/// the network-send consumer.
const BRIDGE_BUFFER_CAPACITY: usize = 64 * 1024;

/// Drives one serial-to-network bridge until the buffer is closed.
pub struct SerialBridge {
    port: Arc<dyn SerialPort>,
    buffer: Arc<CircularBuffer>,
    sequence: AtomicU16,
}

impl SerialBridge {
    pub fn new(port: Arc<dyn SerialPort>) -> Self {
        Self {
            port,
            buffer: Arc::new(CircularBuffer::new(BRIDGE_BUFFER_CAPACITY)),
            sequence: AtomicU16::new(0),
        }
    }

    /// Spawn the three bridge threads against `network`. Returns their join
    /// handles; the caller joins them after signalling shutdown (closing
    /// `self.buffer` and shutting the socket down).
    pub fn spawn(self: &Arc<Self>, network: TcpStream) -> [std::thread::JoinHandle<()>; 3] {
        let producer = {
            let this = self.clone();
            std::thread::spawn(move || this.run_producer())
        };

        let consumer = {
            let this = self.clone();
            let net_write = network.try_clone().expect("clone network socket for consumer");
            std::thread::spawn(move || this.run_consumer(net_write))
        };

        let net_reader = {
            let this = self.clone();
            let net_read = network;
            std::thread::spawn(move || this.run_network_reader(net_read))
        };

        [producer, consumer, net_reader]
    }

    pub fn close(&self) {
        self.buffer.close();
    }

    /// Reads the local serial device into the ring buffer until it closes.
    fn run_producer(&self) {
        let mut chunk = [0u8; 4096];
        loop {
            if self.buffer.is_closed() {
                return;
            }
            match self.port.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => {
                    self.buffer.write(&chunk[..n]);
                }
                Err(e) => {
                    warn!(error = %e, "serial read failed, closing bridge");
                    self.buffer.close();
                    return;
                }
            }
        }
    }

    /// Drains the ring buffer, encapsulates chunks, and sends them framed
    /// over the network until the buffer closes (EOF).
    fn run_consumer(&self, mut network: impl Write) {
        let mut chunk = vec![0u8; SERIAL_MAX_PAYLOAD.min(BRIDGE_BUFFER_CAPACITY)];
        loop {
            let n = self.buffer.read(&mut chunk);
            if n == 0 {
                debug!("serial bridge consumer observed EOF");
                return;
            }
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let header = SerialHeader::new(sequence);
            let Ok(payload) = serial::encapsulate(header, &chunk[..n]) else {
                warn!("serial chunk exceeded max payload, dropping");
                continue;
            };
            let packet = Packet::new(ProtocolId::Serial, 1, payload);
            if let Err(e) = envelope::send_packet(&mut network, &packet) {
                warn!(error = %e, "failed to send serial packet, closing bridge");
                self.buffer.close();
                return;
            }
        }
    }

    /// Reads framed packets from the network and writes the serial payload
    /// straight to the port.
    fn run_network_reader(&self, mut network: impl Read) {
        loop {
            let packet = match envelope::recv_packet(&mut network) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "serial bridge network reader exiting");
                    self.buffer.close();
                    return;
                }
            };
            if packet.protocol_id != u16::from(ProtocolId::Serial) {
                continue;
            }
            let Ok((header, data)) = serial::decapsulate(&packet.payload) else {
                warn!("malformed serial payload from network, skipping");
                continue;
            };
            if let Err(e) = self.port.write(data) {
                warn!(error = %e, "serial write failed");
            }
            if header.is_close() {
                self.buffer.close();
                return;
            }
        }
    }
}
