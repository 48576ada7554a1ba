//! Component L — the USB routing server.
//!
//! A process-wide singleton tracking up to `USB_MAX_CLIENTS` registered USB
//! peers and forwarding URBs between them by `device_id`. Every operation
//! is reentrant: callers are dispatcher threads calling in from arbitrary
//! connections.
//!
//! Lock ordering (spec §5): the registry mutex is always acquired before a
//! target slot's `send_lock`, and released only after the send lock has
//! been acquired — this is what prevents a slot from being freed and
//! reused while a send against it is in flight.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use xoe_core::envelope::{self, Packet, ProtocolId};
use xoe_core::usb::{self, Command, UrbHeader};
use xoe_core::XoeError;
use xoe_services::usb_auth::{self, ClassWhitelist, CHALLENGE_LEN};

/// Default registry capacity (spec §3).
pub const USB_MAX_CLIENTS: usize = 16;

const STATUS_OK: i32 = 0;
const STATUS_AUTH_REQUIRED: i32 = usb::STATUS_AUTH_REQUIRED;
const STATUS_AUTH_FAILED: i32 = usb::STATUS_AUTH_FAILED;
const STATUS_CLASS_BLOCKED: i32 = -3;
const STATUS_REGISTRY_FULL: i32 = -4;
const STATUS_NOT_FOUND: i32 = -5;

struct Slot {
    in_use: bool,
    device_id: u32,
    device_class: u8,
    authenticated: bool,
    auth_pending: bool,
    pending_challenge: [u8; CHALLENGE_LEN],
    peer_addr: SocketAddr,
    client_ip: String,
    stream: TcpStream,
    send_lock: Mutex<()>,
}

impl Slot {
    fn matches_peer(&self, addr: SocketAddr) -> bool {
        self.in_use && self.peer_addr == addr
    }
}

/// The USB device registry and router.
pub struct UsbRouter {
    slots: Mutex<Vec<Slot>>,
    whitelist: ClassWhitelist,
    auth_secret: Vec<u8>,
    routing_errors: AtomicU64,
    auth_failures: AtomicU64,
}

impl UsbRouter {
    pub fn new(whitelist: ClassWhitelist, auth_secret: Vec<u8>) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            whitelist,
            auth_secret,
            routing_errors: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
        }
    }

    pub fn routing_errors(&self) -> u64 {
        self.routing_errors.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    /// Decapsulate `payload` (the envelope's CRC was already verified by
    /// `recv_packet`; the URB's own sum checksum is validated here from the
    /// payload's trailing checksum field) and dispatch by URB command.
    /// Returns the reply packet to write back to `sender_addr`'s socket,
    /// if the command produces one (SUBMIT/RET_SUBMIT forward directly to
    /// the peer and produce no reply to the sender).
    pub fn handle_urb(
        &self,
        payload: &[u8],
        sender_addr: SocketAddr,
        sender_stream: &TcpStream,
    ) -> Result<Option<Packet>, XoeError> {
        let (header, data) = usb::decapsulate(payload)?;
        let command = Command::try_from(header.command)?;

        match command {
            Command::Register => Ok(Some(self.register(header, sender_addr, sender_stream)?)),
            Command::RetAuth => Ok(Some(self.verify_auth(header, data, sender_addr)?)),
            Command::Unregister => Ok(Some(self.unregister(sender_addr)?)),
            Command::Submit | Command::RetSubmit => {
                self.route(header, data, sender_addr)?;
                Ok(None)
            }
            _ => Err(XoeError::invalid_argument(format!(
                "URB command {:?} not handled by the routing server",
                header.command
            ))),
        }
    }

    fn register(&self, header: UrbHeader, sender_addr: SocketAddr, sender_stream: &TcpStream) -> Result<Packet, XoeError> {
        // Protocol convention: `endpoint` carries the device class on
        // CMD_REGISTER, not an actual endpoint number.
        let device_class = header.endpoint;

        if !self.whitelist.is_allowed(device_class) {
            warn!(device_class, "USB registration rejected by class whitelist");
            return Ok(reply_register(header.device_id, STATUS_CLASS_BLOCKED, &[]));
        }

        let mut slots = self.slots.lock().unwrap();
        let free_slot = slots.iter().position(|s| !s.in_use);
        if free_slot.is_none() && slots.len() >= USB_MAX_CLIENTS {
            warn!(device_id = header.device_id, "USB registry full, rejecting registration");
            return Ok(reply_register(header.device_id, STATUS_REGISTRY_FULL, &[]));
        }

        let stream = sender_stream.try_clone().map_err(XoeError::io)?;
        let client_ip = sender_addr.ip().to_string();

        let auth_enabled = usb_auth::auth_enabled(&self.auth_secret);
        let challenge = if auth_enabled {
            usb_auth::generate_challenge()
        } else {
            [0u8; CHALLENGE_LEN]
        };

        let slot = Slot {
            in_use: true,
            device_id: header.device_id,
            device_class,
            authenticated: !auth_enabled,
            auth_pending: auth_enabled,
            pending_challenge: challenge,
            peer_addr: sender_addr,
            client_ip,
            stream,
            send_lock: Mutex::new(()),
        };

        if let Some(free) = free_slot {
            slots[free] = slot;
        } else {
            slots.push(slot);
        }

        if auth_enabled {
            info!(
                device_id = header.device_id,
                device_class,
                challenge = hex::encode(&challenge[..8]),
                "USB registration pending auth"
            );
            Ok(reply_register(header.device_id, STATUS_AUTH_REQUIRED, &challenge))
        } else {
            info!(device_id = header.device_id, device_class, "USB device registered");
            Ok(reply_register(header.device_id, STATUS_OK, &[]))
        }
    }

    fn verify_auth(&self, header: UrbHeader, response: &[u8], sender_addr: SocketAddr) -> Result<Packet, XoeError> {
        let mut slots = self.slots.lock().unwrap();
        let Some(slot) = slots.iter_mut().find(|s| s.matches_peer(sender_addr)) else {
            return Ok(reply_register(header.device_id, STATUS_NOT_FOUND, &[]));
        };

        let ok = usb_auth::verify_response(
            &self.auth_secret,
            &slot.pending_challenge,
            slot.device_id,
            slot.device_class,
            response,
        );

        if ok {
            slot.authenticated = true;
            slot.auth_pending = false;
            info!(device_id = slot.device_id, "USB device authenticated");
            Ok(reply_register(slot.device_id, STATUS_OK, &[]))
        } else {
            let device_id = slot.device_id;
            let index = slots.iter().position(|s| s.matches_peer(sender_addr)).unwrap();
            slots.remove(index);
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
            warn!(device_id, "USB authentication failed");
            Ok(reply_register(device_id, STATUS_AUTH_FAILED, &[]))
        }
    }

    fn unregister(&self, sender_addr: SocketAddr) -> Result<Packet, XoeError> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(index) = slots.iter().position(|s| s.matches_peer(sender_addr)) {
            let device_id = slots[index].device_id;
            slots.remove(index);
            info!(device_id, "USB device unregistered");
            Ok(reply_simple(Command::RetUnregister, device_id, STATUS_OK))
        } else {
            Ok(reply_simple(Command::RetUnregister, 0, STATUS_NOT_FOUND))
        }
    }

    /// Drop any registry entry belonging to `addr`, with no reply produced.
    ///
    /// Called by the dispatcher on connection teardown (spec §4.K step 4:
    /// "unregister the socket from the USB routing server") — unlike
    /// [`Self::unregister`], which answers a client-issued `CMD_UNREGISTER`,
    /// this covers the case where the socket simply disconnected without
    /// ever sending one.
    pub fn unregister_peer(&self, addr: SocketAddr) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(index) = slots.iter().position(|s| s.matches_peer(addr)) {
            let device_id = slots[index].device_id;
            slots.remove(index);
            info!(device_id, peer = %addr, "USB peer disconnected, registry entry dropped");
        }
    }

    fn route(&self, header: UrbHeader, data: &[u8], sender_addr: SocketAddr) -> Result<(), XoeError> {
        let mut slots = self.slots.lock().unwrap();
        let Some(index) = slots
            .iter()
            .position(|s| s.in_use && s.device_id == header.device_id && s.peer_addr != sender_addr)
        else {
            self.routing_errors.fetch_add(1, Ordering::Relaxed);
            return Err(XoeError::NotFound);
        };

        let send_guard = slots[index].send_lock.lock().unwrap();
        let mut target_stream = match slots[index].stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                self.routing_errors.fetch_add(1, Ordering::Relaxed);
                return Err(XoeError::io(e));
            }
        };
        drop(slots);

        let packet = build_usb_packet(&header, data)?;
        let send_result = envelope::send_packet(&mut target_stream, &packet);
        drop(send_guard);

        if let Err(e) = send_result {
            self.routing_errors.fetch_add(1, Ordering::Relaxed);
            warn!(device_id = header.device_id, error = %e, "USB URB routing send failed");
        }
        Ok(())
    }
}

fn build_usb_packet(header: &UrbHeader, data: &[u8]) -> Result<Packet, XoeError> {
    let payload = usb::encapsulate(header, data)?;
    Ok(Packet::new(ProtocolId::Usb, 1, payload))
}

fn reply_register(device_id: u32, status: i32, challenge_payload: &[u8]) -> Packet {
    reply_with_status(Command::RetRegister, device_id, status, challenge_payload)
}

fn reply_simple(command: Command, device_id: u32, status: i32) -> Packet {
    reply_with_status(command, device_id, status, &[])
}

fn reply_with_status(command: Command, device_id: u32, status: i32, payload: &[u8]) -> Packet {
    let header = UrbHeader {
        command: command.into(),
        flags: 0,
        seqnum: 0,
        device_id,
        endpoint: 0,
        transfer_type: 0,
        reserved: 0,
        transfer_length: payload.len() as u32,
        actual_length: payload.len() as u32,
        status,
        setup: [0; 8],
    };
    let urb_payload = usb::encapsulate(&header, payload).expect("reply payload within bounds");
    Packet::new(ProtocolId::Usb, 1, urb_payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, peer) = listener.accept().unwrap();
        (client, peer, server_side)
    }

    fn sample_register_urb(device_id: u32, device_class: u8) -> UrbHeader {
        UrbHeader {
            command: Command::Register.into(),
            flags: 0,
            seqnum: 1,
            device_id,
            endpoint: device_class,
            transfer_type: 0,
            reserved: 0,
            transfer_length: 0,
            actual_length: 0,
            status: 0,
            setup: [0; 8],
        }
    }

    #[test]
    fn registration_without_auth_completes_immediately() {
        let router = UsbRouter::new(ClassWhitelist::default(), Vec::new());
        let (client, addr, server_side) = loopback_pair();

        let header = sample_register_urb(0x0001_0002, 0x08);
        let payload = usb::encapsulate(&header, &[]).unwrap();

        let reply = router.handle_urb(&payload, addr, &server_side).unwrap();
        assert!(reply.is_some());

        drop(client);
    }

    #[test]
    fn registration_blocked_by_whitelist_is_rejected() {
        let router = UsbRouter::new(ClassWhitelist::default(), Vec::new());
        let (client, addr, server_side) = loopback_pair();

        // Class 0x03 (HID) is blocked by the default empty whitelist.
        let header = sample_register_urb(0x0001_0002, 0x03);
        let payload = usb::encapsulate(&header, &[]).unwrap();

        let reply = router.handle_urb(&payload, addr, &server_side).unwrap().unwrap();
        let (reply_header, _) = usb::decapsulate(&reply.payload).unwrap();
        assert_eq!(reply_header.status, STATUS_CLASS_BLOCKED);

        drop(client);
    }

    #[test]
    fn routing_to_unknown_device_id_reports_not_found() {
        let router = UsbRouter::new(ClassWhitelist::default(), Vec::new());
        let (client, addr, server_side) = loopback_pair();

        let header = UrbHeader {
            command: Command::Submit.into(),
            flags: 0,
            seqnum: 1,
            device_id: 0xDEAD_BEEF,
            endpoint: 0x81,
            transfer_type: 2,
            reserved: 0,
            transfer_length: 4,
            actual_length: 4,
            status: 0,
            setup: [0; 8],
        };
        let payload = usb::encapsulate(&header, &[1, 2, 3, 4]).unwrap();

        let result = router.handle_urb(&payload, addr, &server_side);
        assert!(matches!(result, Err(XoeError::NotFound)));
        assert_eq!(router.routing_errors(), 1);

        drop(client);
    }
}
