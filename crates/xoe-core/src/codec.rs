//! Component A — the byte codec.
//!
//! Pure, allocation-free big-endian integer access plus the zlib-compatible
//! CRC-32 used everywhere on the wire. Every other codec in this crate goes
//! through these functions rather than touching bytes directly — there are
//! no pointers, no `#[repr(C)]` reinterpret-casts, and no native-endian
//! leakage onto the wire.
//!
//! Out-of-range offsets are a contract violation by the caller, not a
//! runtime error: callers are expected to size buffers from a header they
//! just parsed. Debug builds assert; release builds would panic on the
//! slice index anyway, which is the correct failure mode for caller bugs.

/// Read a big-endian `u16` at `offset`.
pub fn read_u16_be(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read a big-endian `u32` at `offset`.
pub fn read_u32_be(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Read a big-endian `u64` at `offset`.
pub fn read_u64_be(buf: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(b)
}

/// Read a big-endian `i32` at `offset`.
pub fn read_i32_be(buf: &[u8], offset: usize) -> i32 {
    read_u32_be(buf, offset) as i32
}

/// Write a big-endian `u16` at `offset`.
pub fn write_u16_be(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Write a big-endian `u32` at `offset`.
pub fn write_u32_be(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Write a big-endian `u64` at `offset`.
pub fn write_u64_be(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Write a big-endian `i32` at `offset`.
pub fn write_i32_be(buf: &mut [u8], offset: usize, value: i32) {
    write_u32_be(buf, offset, value as u32);
}

/// IEEE 802.3 (zlib-compatible) CRC-32 over `data`.
///
/// Used as the envelope checksum (component B) for every protocol.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Wrapping sum-of-bytes checksum.
///
/// This is the weaker, USB-IP-heritage checksum carried *inside* the USB
/// URB payload (component D) — not the envelope's CRC-32.
pub fn sum_checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}
