//! Component B — the envelope codec and framed I/O.
//!
//! `xoe_packet` is the length-prefixed, CRC-validated frame that carries
//! every payload type across the wire. The 12-byte header is fixed:
//!
//! ```text
//! offset 0  : protocol_id         u16
//! offset 2  : protocol_version    u16
//! offset 4  : payload_length      u32   (<= MAX_PAYLOAD_LEN)
//! offset 8  : checksum            u32   (CRC-32 of bytes 0..8 ++ payload)
//! offset 12 : payload             [u8; payload_length]
//! ```
//!
//! `send_packet`/`recv_packet` work over any `Read + Write` stream, so the
//! same code drives plain TCP and the TLS adapter (`xoe-services::tls`)
//! identically — the only difference is which stream type the caller hands
//! in.

use std::io::{Read, Write};

use crate::codec::{crc32, read_u16_be, read_u32_be, write_u16_be, write_u32_be};
use crate::error::XoeError;

/// Fixed 12-byte envelope header size.
pub const HEADER_LEN: usize = 12;

/// Maximum payload length carried by one envelope (spec invariant).
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// `protocol_id` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProtocolId {
    Raw = 0,
    Serial = 1,
    Usb = 2,
    Nbd = 3,
}

impl TryFrom<u16> for ProtocolId {
    type Error = XoeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProtocolId::Raw),
            1 => Ok(ProtocolId::Serial),
            2 => Ok(ProtocolId::Usb),
            3 => Ok(ProtocolId::Nbd),
            other => Err(XoeError::protocol(format!("unknown protocol_id {other}"))),
        }
    }
}

impl From<ProtocolId> for u16 {
    fn from(p: ProtocolId) -> u16 {
        p as u16
    }
}

/// An owned `xoe_packet` envelope.
///
/// The encapsulator that builds a `Packet` exclusively owns its payload
/// buffer; there is never a shared or borrowed pointer baked into the wire
/// representation — every byte is produced by `to_bytes`/`from_bytes`.
#[derive(Debug, Clone)]
pub struct Packet {
    pub protocol_id: u16,
    pub protocol_version: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(protocol_id: ProtocolId, protocol_version: u16, payload: Vec<u8>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            protocol_version,
            payload,
        }
    }

    /// Checksum over the 8 pre-checksum header bytes plus the payload.
    fn compute_checksum(&self) -> u32 {
        let mut prefix = [0u8; 4];
        write_u16_be(&mut prefix, 0, self.protocol_id);
        write_u16_be(&mut prefix, 2, self.protocol_version);
        let mut hasher_input = Vec::with_capacity(4 + self.payload.len());
        hasher_input.extend_from_slice(&prefix);
        hasher_input.extend_from_slice(&self.payload);
        crc32(&hasher_input)
    }

    /// Serialise this packet to its full wire representation (header + payload).
    pub fn to_bytes(&self) -> Result<Vec<u8>, XoeError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(XoeError::protocol(format!(
                "payload length {} exceeds maximum {}",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        let checksum = self.compute_checksum();
        let mut out = vec![0u8; HEADER_LEN + self.payload.len()];
        write_u16_be(&mut out, 0, self.protocol_id);
        write_u16_be(&mut out, 2, self.protocol_version);
        write_u32_be(&mut out, 4, self.payload.len() as u32);
        write_u32_be(&mut out, 8, checksum);
        out[HEADER_LEN..].copy_from_slice(&self.payload);
        Ok(out)
    }
}

/// Read exactly `buf.len()` bytes, retrying partial reads until the buffer
/// is full or the stream returns EOF/error.
fn read_exact_retrying<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), XoeError> {
    stream.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            XoeError::NetworkError("connection closed".into())
        } else {
            XoeError::io(e)
        }
    })
}

/// Send a packet: compute the checksum, write header then payload.
pub fn send_packet<W: Write>(stream: &mut W, packet: &Packet) -> Result<(), XoeError> {
    let bytes = packet.to_bytes()?;
    stream.write_all(&bytes).map_err(XoeError::from)?;
    stream.flush().map_err(XoeError::from)
}

/// Receive one packet: read the 12-byte header, validate the length bound,
/// read exactly that many payload bytes, and verify the checksum.
pub fn recv_packet<R: Read>(stream: &mut R) -> Result<Packet, XoeError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_retrying(stream, &mut header)?;

    let protocol_id = read_u16_be(&header, 0);
    let protocol_version = read_u16_be(&header, 2);
    let payload_length = read_u32_be(&header, 4) as usize;
    let checksum = read_u32_be(&header, 8);

    if payload_length > MAX_PAYLOAD_LEN {
        return Err(XoeError::protocol(format!(
            "payload length {payload_length} exceeds maximum {MAX_PAYLOAD_LEN}"
        )));
    }

    let mut payload = vec![0u8; payload_length];
    read_exact_retrying(stream, &mut payload)?;

    let packet = Packet {
        protocol_id,
        protocol_version,
        payload,
    };

    if packet.compute_checksum() != checksum {
        return Err(XoeError::ChecksumMismatch);
    }

    Ok(packet)
}
