//! The `xoed` daemon: server mode plus the client-mode bridges.
//!
//! `main.rs` is a thin CLI/signal-handling shell around the pieces exposed
//! here; everything with meaningful logic lives in a module so it can be
//! exercised by `tests/integration`.

pub mod config;
pub mod dispatcher;
pub mod nbd_listener;
pub mod pool;
pub mod serial_bridge;
pub mod server;
pub mod usb_client;
pub mod usb_router;
