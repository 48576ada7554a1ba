//! xoe-core — wire format primitives shared by every XOE component.
//!
//! Everything here is pure, allocation-light codec logic: big-endian byte
//! access, the envelope framing header, and the per-protocol nested headers
//! (serial, USB URB, NBD). No sockets, no threads, no TLS — those live in
//! `xoe-services` and `xoed`.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod nbd;
pub mod serial;
pub mod usb;

pub use error::XoeError;
