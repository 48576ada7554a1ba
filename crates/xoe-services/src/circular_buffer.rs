//! Component C — the serial bridge's circular byte buffer.
//!
//! A bounded, thread-safe ring buffer shared between a producer thread
//! (reading from a serial device or the network) and a consumer thread
//! (draining into framed packets or back onto the wire). Blocking is
//! condition-variable based rather than async, matching the thread-per-role
//! model the serial bridge runs under (`xoed::serial_bridge`).

use std::sync::{Condvar, Mutex};

/// Ring state guarded by `CircularBuffer`'s mutex.
struct Ring {
    data: Vec<u8>,
    capacity: usize,
    head: usize,
    tail: usize,
    count: usize,
    closed: bool,
}

impl Ring {
    fn free_space(&self) -> usize {
        self.capacity - self.count
    }
}

/// A bounded thread-safe circular byte buffer with close semantics.
///
/// `write` blocks while full and open; `read` blocks while empty and open.
/// Closing wakes every blocked waiter so producers/consumers can observe
/// shutdown instead of hanging forever.
pub struct CircularBuffer {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                data: vec![0u8; capacity],
                capacity,
                head: 0,
                tail: 0,
                count: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Write as much of `bytes` as fits, blocking on full until space frees
    /// up or the buffer closes. Returns the number of bytes actually
    /// written, which may be less than `bytes.len()` only if the buffer
    /// closed mid-write.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut written = 0;
        let mut ring = self.ring.lock().unwrap();

        while written < bytes.len() {
            while ring.free_space() == 0 && !ring.closed {
                ring = self.not_full.wait(ring).unwrap();
            }
            if ring.closed {
                break;
            }

            let chunk = &bytes[written..];
            let to_write = chunk.len().min(ring.free_space());
            let capacity = ring.capacity;
            let head = ring.head;

            let first_run = to_write.min(capacity - head);
            ring.data[head..head + first_run].copy_from_slice(&chunk[..first_run]);
            let remaining = to_write - first_run;
            if remaining > 0 {
                ring.data[..remaining].copy_from_slice(&chunk[first_run..first_run + remaining]);
            }

            ring.head = (head + to_write) % capacity;
            ring.count += to_write;
            written += to_write;

            self.not_empty.notify_all();
        }

        written
    }

    /// Read up to `dst.len()` bytes, blocking on empty until data arrives
    /// or the buffer closes. Returns 0 once the buffer is closed and
    /// drained (EOF).
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut ring = self.ring.lock().unwrap();

        while ring.count == 0 && !ring.closed {
            ring = self.not_empty.wait(ring).unwrap();
        }
        if ring.count == 0 {
            return 0;
        }

        let to_read = dst.len().min(ring.count);
        let capacity = ring.capacity;
        let tail = ring.tail;

        let first_run = to_read.min(capacity - tail);
        dst[..first_run].copy_from_slice(&ring.data[tail..tail + first_run]);
        let remaining = to_read - first_run;
        if remaining > 0 {
            dst[first_run..first_run + remaining].copy_from_slice(&ring.data[..remaining]);
        }

        ring.tail = (tail + to_read) % capacity;
        ring.count -= to_read;

        self.not_full.notify_all();
        to_read
    }

    /// Bytes currently available to read.
    pub fn available(&self) -> usize {
        self.ring.lock().unwrap().count
    }

    /// Free capacity currently available to write.
    pub fn free_space(&self) -> usize {
        self.ring.lock().unwrap().free_space()
    }

    /// Mark the buffer closed and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.ring.lock().unwrap().closed
    }
}
