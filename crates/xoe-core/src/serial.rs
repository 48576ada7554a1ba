//! Component D (serial) — the nested serial header.
//!
//! A serial envelope's payload begins with a 4-byte header before the raw
//! bytes being tunnelled:
//!
//! ```text
//! offset 0 : flags      u16
//! offset 2 : sequence   u16
//! offset 4 : data       [u8]
//! ```
//!
//! `flags` is a bitset; only bit 0 (`FLAG_CLOSE`) is currently assigned,
//! marking the final packet of a closing stream so the peer can stop its
//! producer thread without waiting on a read timeout.

use crate::codec::{read_u16_be, write_u16_be};
use crate::error::XoeError;

/// Fixed size of the nested serial header.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single serial packet may carry, leaving room under the
/// envelope's 1 MiB cap for the nested header.
pub const SERIAL_MAX_PAYLOAD: usize = crate::envelope::MAX_PAYLOAD_LEN - HEADER_LEN;

/// Set on the last packet before a producer or consumer shuts its end down.
pub const FLAG_CLOSE: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialHeader {
    pub flags: u16,
    pub sequence: u16,
}

impl SerialHeader {
    pub fn new(sequence: u16) -> Self {
        Self { flags: 0, sequence }
    }

    pub fn is_close(&self) -> bool {
        self.flags & FLAG_CLOSE != 0
    }

    pub fn with_close(mut self) -> Self {
        self.flags |= FLAG_CLOSE;
        self
    }

    pub fn decode(buf: &[u8]) -> Result<Self, XoeError> {
        if buf.len() < HEADER_LEN {
            return Err(XoeError::BufferTooSmall {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        Ok(Self {
            flags: read_u16_be(buf, 0),
            sequence: read_u16_be(buf, 2),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), XoeError> {
        if buf.len() < HEADER_LEN {
            return Err(XoeError::BufferTooSmall {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        write_u16_be(buf, 0, self.flags);
        write_u16_be(buf, 2, self.sequence);
        Ok(())
    }
}

/// Build a full serial packet payload (header + data) ready to hand to
/// `envelope::Packet::new`.
pub fn encapsulate(header: SerialHeader, data: &[u8]) -> Result<Vec<u8>, XoeError> {
    if data.len() > SERIAL_MAX_PAYLOAD {
        return Err(XoeError::invalid_argument(format!(
            "serial payload {} exceeds max {}",
            data.len(),
            SERIAL_MAX_PAYLOAD
        )));
    }
    let mut out = vec![0u8; HEADER_LEN + data.len()];
    header.encode(&mut out)?;
    out[HEADER_LEN..].copy_from_slice(data);
    Ok(out)
}

/// Split an envelope payload into its serial header and data slice.
pub fn decapsulate(payload: &[u8]) -> Result<(SerialHeader, &[u8]), XoeError> {
    let header = SerialHeader::decode(payload)?;
    Ok((header, &payload[HEADER_LEN..]))
}
