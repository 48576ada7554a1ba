//! Component J — the fixed-size connection pool.
//!
//! A process-wide registry of up to `MAX_CLIENTS` accepted sockets. Every
//! mutation goes through one pool-wide mutex, held only briefly — the
//! per-connection dispatcher threads hold their slot by index, not by
//! reference, so the lock never has to be held across socket I/O.

use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Default slot count (spec §3).
pub const MAX_CLIENTS: usize = 32;

struct Slot {
    socket: Option<TcpStream>,
    peer_addr: Option<SocketAddr>,
    in_use: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            socket: None,
            peer_addr: None,
            in_use: false,
        }
    }
}

/// The fixed-size client pool.
pub struct ConnectionPool {
    slots: Mutex<Vec<Slot>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(MAX_CLIENTS)
    }
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        Self { slots: Mutex::new(slots) }
    }

    /// Claim a free slot for `socket`, returning its index, or `None` if
    /// the pool is full.
    pub fn acquire(&self, socket: TcpStream, peer_addr: SocketAddr) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots.iter().position(|s| !s.in_use)?;
        slots[index] = Slot {
            socket: Some(socket),
            peer_addr: Some(peer_addr),
            in_use: true,
        };
        Some(index)
    }

    /// Release a slot back to the pool, dropping its socket.
    pub fn release(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(index) {
            *slot = Slot::empty();
        }
    }

    /// Close every in-use socket, waking blocked I/O in owning threads.
    /// Slots are not released here — the owning dispatcher thread releases
    /// its own slot once `recv_packet` observes the closed socket.
    pub fn disconnect_all(&self) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            if let Some(socket) = &slot.socket {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    /// Poll `active_count` until it reaches zero or `timeout` elapses; on
    /// timeout, force-clear any remaining slots and warn.
    pub fn wait_for_idle(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(50);
        while Instant::now() < deadline {
            if self.active_count() == 0 {
                return;
            }
            std::thread::sleep(poll_interval);
        }
        let remaining = self.active_count();
        if remaining > 0 {
            warn!(remaining, "force-clearing pool slots after shutdown timeout");
            let mut slots = self.slots.lock().unwrap();
            for slot in slots.iter_mut() {
                *slot = Slot::empty();
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
