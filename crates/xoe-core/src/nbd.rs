//! Component E — the NBD protocol codec.
//!
//! Two distinct wire shapes live here: the 28-byte nested header used when
//! NBD traffic is tunnelled inside an `xoe_packet` envelope, and the
//! constants for the native NBD Fixed-Newstyle wire protocol that
//! `xoe-services::nbd_session` speaks directly on its own dedicated TCP
//! connection (spec §4.F). The two never mix on the same socket.

use crate::codec::{read_u16_be, read_u32_be, read_u64_be, write_u16_be, write_u32_be, write_u64_be};
use crate::error::XoeError;

/// Fixed size of the envelope-nested NBD header.
pub const HEADER_LEN: usize = 28;

/// Largest payload a tunnelled NBD packet may carry.
pub const NBD_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// The envelope-nested NBD command/flag header (spec §3).
///
/// Not to be confused with the native request header below — this one only
/// appears inside an XOE envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedHeader {
    pub command: u8,
    pub flags: u8,
    pub reserved: u16,
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
    pub error: u32,
}

impl NestedHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, XoeError> {
        if buf.len() < HEADER_LEN {
            return Err(XoeError::BufferTooSmall {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        Ok(Self {
            command: buf[0],
            flags: buf[1],
            reserved: read_u16_be(buf, 2),
            cookie: read_u64_be(buf, 4),
            offset: read_u64_be(buf, 12),
            length: read_u32_be(buf, 20),
            error: read_u32_be(buf, 24),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<(), XoeError> {
        if buf.len() < HEADER_LEN {
            return Err(XoeError::BufferTooSmall {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        buf[0] = self.command;
        buf[1] = self.flags;
        write_u16_be(buf, 2, self.reserved);
        write_u64_be(buf, 4, self.cookie);
        write_u64_be(buf, 12, self.offset);
        write_u32_be(buf, 20, self.length);
        write_u32_be(buf, 24, self.error);
        Ok(())
    }
}

/// Build an envelope payload (header + data) for a tunnelled NBD request.
pub fn encapsulate(header: &NestedHeader, data: &[u8]) -> Result<Vec<u8>, XoeError> {
    if data.len() > NBD_MAX_PAYLOAD {
        return Err(XoeError::invalid_argument(format!(
            "NBD payload {} exceeds max {}",
            data.len(),
            NBD_MAX_PAYLOAD
        )));
    }
    let mut out = vec![0u8; HEADER_LEN + data.len()];
    header.encode(&mut out)?;
    out[HEADER_LEN..].copy_from_slice(data);
    Ok(out)
}

/// Split a tunnelled NBD envelope payload into its header and data slice.
pub fn decapsulate(payload: &[u8]) -> Result<(NestedHeader, &[u8]), XoeError> {
    let header = NestedHeader::decode(payload)?;
    Ok((header, &payload[HEADER_LEN..]))
}

// --- Native NBD Fixed-Newstyle wire protocol constants (spec §4.F) ---

/// Opening magic sent by the server at the start of GREETING.
pub const NBDMAGIC: u64 = 0x4e42444d41474943;

/// Second magic sent by the server, signalling option negotiation support.
pub const IHAVEOPT: u64 = 0x49484156454F5054;

/// Magic prefixing every native NBD request.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;

/// Magic prefixing every native NBD simple reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

/// The only supported option during negotiation.
pub const NBD_OPT_EXPORT_NAME: u32 = 1;

/// Server always sets this — transmission flags are meaningful.
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
/// Set when the backend rejects writes.
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
/// Set when the backend supports `FLUSH`.
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
/// Set when the backend supports `TRIM`.
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;

/// Native request `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestType {
    Read = 0,
    Write = 1,
    Disc = 2,
    Flush = 3,
    Trim = 4,
}

impl TryFrom<u16> for RequestType {
    type Error = XoeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use RequestType::*;
        match value {
            0 => Ok(Read),
            1 => Ok(Write),
            2 => Ok(Disc),
            3 => Ok(Flush),
            4 => Ok(Trim),
            other => Err(XoeError::invalid_argument(format!(
                "unknown NBD request type {other}"
            ))),
        }
    }
}

/// Fixed size of one native NBD request header.
pub const REQUEST_HEADER_LEN: usize = 28;

/// A parsed native NBD request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub flags: u16,
    pub request_type: u16,
    pub cookie: u64,
    pub offset: u64,
    pub length: u32,
}

impl Request {
    /// Decode a 28-byte native request, validating the leading magic.
    pub fn decode(buf: &[u8]) -> Result<Self, XoeError> {
        if buf.len() < REQUEST_HEADER_LEN {
            return Err(XoeError::BufferTooSmall {
                needed: REQUEST_HEADER_LEN,
                available: buf.len(),
            });
        }
        let magic = read_u32_be(buf, 0);
        if magic != REQUEST_MAGIC {
            return Err(XoeError::protocol(format!(
                "invalid NBD request magic {magic:#010x}"
            )));
        }
        Ok(Self {
            flags: read_u16_be(buf, 4),
            request_type: read_u16_be(buf, 6),
            cookie: read_u64_be(buf, 8),
            offset: read_u64_be(buf, 16),
            length: read_u32_be(buf, 24),
        })
    }
}

/// A native NBD simple reply: 16-byte header optionally followed by data.
pub fn encode_simple_reply(error: u32, cookie: u64) -> [u8; 16] {
    let mut buf = [0u8; 16];
    write_u32_be(&mut buf, 0, SIMPLE_REPLY_MAGIC);
    write_u32_be(&mut buf, 4, error);
    write_u64_be(&mut buf, 8, cookie);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_nested() -> NestedHeader {
        NestedHeader {
            command: 0,
            flags: 0,
            reserved: 0,
            cookie: 99,
            offset: 4096,
            length: 512,
            error: 0,
        }
    }

    #[test]
    fn nested_header_round_trips() {
        let header = sample_nested();
        let payload = encapsulate(&header, &[1, 2, 3]).unwrap();
        let (recovered, data) = decapsulate(&payload).unwrap();
        assert_eq!(recovered, header);
        assert_eq!(data, &[1, 2, 3]);
    }

    #[test]
    fn oversized_nested_payload_is_rejected() {
        let header = sample_nested();
        let data = vec![0u8; NBD_MAX_PAYLOAD + 1];
        assert!(encapsulate(&header, &data).is_err());
    }

    #[test]
    fn request_rejects_bad_magic() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        write_u32_be(&mut buf, 0, 0xDEAD_BEEF);
        assert!(matches!(Request::decode(&buf), Err(XoeError::ProtocolError(_))));
    }

    #[test]
    fn request_round_trips_fields() {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        write_u32_be(&mut buf, 0, REQUEST_MAGIC);
        write_u16_be(&mut buf, 4, 0);
        write_u16_be(&mut buf, 6, RequestType::Write as u16);
        write_u64_be(&mut buf, 8, 42);
        write_u64_be(&mut buf, 16, 8192);
        write_u32_be(&mut buf, 24, 4096);

        let req = Request::decode(&buf).unwrap();
        assert_eq!(req.cookie, 42);
        assert_eq!(req.offset, 8192);
        assert_eq!(req.length, 4096);
        assert_eq!(RequestType::try_from(req.request_type).unwrap(), RequestType::Write);
    }

    #[test]
    fn simple_reply_encodes_magic_and_cookie() {
        let reply = encode_simple_reply(0, 7);
        assert_eq!(read_u32_be(&reply, 0), SIMPLE_REPLY_MAGIC);
        assert_eq!(read_u64_be(&reply, 8), 7);
    }
}
