//! Component F — the native NBD session (Fixed Newstyle).
//!
//! Runs on a TCP connection dedicated to one native NBD client — no XOE
//! envelope, no TLS; NBD clients speak the wire protocol directly. One
//! thread per accepted connection (`xoed::main` spawns it), mirroring the
//! dispatcher's thread-per-connection model in `xoed::dispatcher`.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, info, warn};

use xoe_core::error::NbdErrorCode;
use xoe_core::nbd::{
    self, RequestType, IHAVEOPT, NBDMAGIC, NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY,
    NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM, NBD_OPT_EXPORT_NAME, REQUEST_HEADER_LEN,
};
use xoe_core::XoeError;

use crate::backend::BlockBackend;

/// States of the Fixed-Newstyle handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Greeting,
    OptNeg,
    Transmission,
    Closed,
}

/// One NBD session, bound to a backend and an export name.
pub struct NbdSession<S> {
    stream: S,
    backend: Arc<dyn BlockBackend>,
    export_name: String,
    state: HandshakeState,
    transmission_flags: u16,
}

impl<S: Read + Write> NbdSession<S> {
    pub fn new(stream: S, backend: Arc<dyn BlockBackend>, export_name: impl Into<String>) -> Self {
        Self {
            stream,
            backend,
            export_name: export_name.into(),
            state: HandshakeState::Greeting,
            transmission_flags: 0,
        }
    }

    /// Run the handshake and then the request loop until the client
    /// disconnects or sends `DISC`.
    pub fn run(&mut self) -> Result<(), XoeError> {
        self.greeting()?;
        self.option_negotiation()?;
        self.request_loop()?;
        self.state = HandshakeState::Closed;
        Ok(())
    }

    fn greeting(&mut self) -> Result<(), XoeError> {
        let mut out = Vec::with_capacity(18);
        out.extend_from_slice(&NBDMAGIC.to_be_bytes());
        out.extend_from_slice(&IHAVEOPT.to_be_bytes());
        out.extend_from_slice(&NBD_FLAG_HAS_FLAGS.to_be_bytes());
        self.stream.write_all(&out).map_err(XoeError::io)?;
        self.stream.flush().map_err(XoeError::io)?;

        let mut client_flags = [0u8; 4];
        self.stream.read_exact(&mut client_flags).map_err(XoeError::io)?;

        self.state = HandshakeState::OptNeg;
        Ok(())
    }

    fn option_negotiation(&mut self) -> Result<(), XoeError> {
        let mut magic_buf = [0u8; 8];
        self.stream.read_exact(&mut magic_buf).map_err(XoeError::io)?;
        let magic = u64::from_be_bytes(magic_buf);
        if magic != IHAVEOPT {
            return Err(XoeError::protocol(format!("invalid option magic {magic:#018x}")));
        }

        let mut opt_buf = [0u8; 4];
        self.stream.read_exact(&mut opt_buf).map_err(XoeError::io)?;
        let option = u32::from_be_bytes(opt_buf);

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(XoeError::io)?;
        let option_len = u32::from_be_bytes(len_buf) as usize;

        let mut name_buf = vec![0u8; option_len];
        self.stream.read_exact(&mut name_buf).map_err(XoeError::io)?;

        if option != NBD_OPT_EXPORT_NAME {
            return Err(XoeError::NotSupported(format!("unsupported NBD option {option}")));
        }

        debug!(requested_export = %String::from_utf8_lossy(&name_buf), "NBD export name option received");

        let mut flags = NBD_FLAG_HAS_FLAGS;
        if self.backend.is_read_only() {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags |= NBD_FLAG_SEND_FLUSH;
        flags |= NBD_FLAG_SEND_TRIM;
        self.transmission_flags = flags;

        let mut reply = Vec::with_capacity(8 + 2 + 124);
        reply.extend_from_slice(&self.backend.get_size().to_be_bytes());
        reply.extend_from_slice(&flags.to_be_bytes());
        reply.extend_from_slice(&[0u8; 124]);
        self.stream.write_all(&reply).map_err(XoeError::io)?;
        self.stream.flush().map_err(XoeError::io)?;

        self.state = HandshakeState::Transmission;
        info!(export = %self.export_name, size = self.backend.get_size(), "NBD transmission phase started");
        Ok(())
    }

    fn request_loop(&mut self) -> Result<(), XoeError> {
        loop {
            let mut header_buf = [0u8; REQUEST_HEADER_LEN];
            match self.stream.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(XoeError::io(e)),
            }

            let request = nbd::Request::decode(&header_buf)?;

            let request_type = match RequestType::try_from(request.request_type) {
                Ok(t) => t,
                Err(_) => {
                    self.reply_error(request.cookie, NbdErrorCode::EInval)?;
                    continue;
                }
            };

            match request_type {
                RequestType::Read => self.handle_read(request.cookie, request.offset, request.length)?,
                RequestType::Write => self.handle_write(request.cookie, request.offset, request.length)?,
                RequestType::Disc => {
                    debug!("NBD client requested disconnect");
                    return Ok(());
                }
                RequestType::Flush => self.handle_flush(request.cookie)?,
                RequestType::Trim => self.handle_trim(request.cookie, request.offset, request.length)?,
            }
        }
    }

    fn handle_read(&mut self, cookie: u64, offset: u64, length: u32) -> Result<(), XoeError> {
        match self.backend.pread(offset, length) {
            Ok(data) => {
                let reply = nbd::encode_simple_reply(u32::from(NbdErrorCode::Ok), cookie);
                self.stream.write_all(&reply).map_err(XoeError::io)?;
                self.stream.write_all(&data).map_err(XoeError::io)?;
                self.stream.flush().map_err(XoeError::io)
            }
            Err(e) => {
                warn!(error = %e, offset, length, "NBD read failed");
                self.reply_error(cookie, NbdErrorCode::EIo)
            }
        }
    }

    fn handle_write(&mut self, cookie: u64, offset: u64, length: u32) -> Result<(), XoeError> {
        let mut data = vec![0u8; length as usize];
        self.stream.read_exact(&mut data).map_err(XoeError::io)?;

        match self.backend.pwrite(offset, &data) {
            Ok(()) => self.reply_error(cookie, NbdErrorCode::Ok),
            Err(e) => {
                warn!(error = %e, offset, length, "NBD write failed");
                self.reply_error(cookie, NbdErrorCode::EIo)
            }
        }
    }

    fn handle_flush(&mut self, cookie: u64) -> Result<(), XoeError> {
        match self.backend.flush() {
            Ok(()) => self.reply_error(cookie, NbdErrorCode::Ok),
            Err(_) => self.reply_error(cookie, NbdErrorCode::EIo),
        }
    }

    fn handle_trim(&mut self, cookie: u64, offset: u64, length: u32) -> Result<(), XoeError> {
        // Trim is best-effort: report success regardless of backend outcome.
        let _ = self.backend.trim(offset, length);
        self.reply_error(cookie, NbdErrorCode::Ok)
    }

    fn reply_error(&mut self, cookie: u64, code: NbdErrorCode) -> Result<(), XoeError> {
        let reply = nbd::encode_simple_reply(u32::from(code), cookie);
        self.stream.write_all(&reply).map_err(XoeError::io)?;
        self.stream.flush().map_err(XoeError::io)
    }
}
