//! End-to-end scenarios exercised over real sockets rather than in-process
//! pipes, crossing xoe-core/xoe-services/xoed crate boundaries the way a
//! deployed daemon actually would.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use xoe_core::envelope::{self, Packet, ProtocolId};
use xoe_core::nbd::{self, RequestType, IHAVEOPT, NBD_OPT_EXPORT_NAME};
use xoe_core::usb::{self, Command, UrbHeader, TransferType, SETUP_LEN};
use xoe_services::backend::{BlockBackend, FileBackend};
use xoe_services::nbd_session::NbdSession;
use xoe_services::usb_auth::{self, ClassWhitelist, CHALLENGE_LEN};
use xoed::pool::ConnectionPool;
use xoed::usb_router::UsbRouter;

fn loopback_pair() -> (TcpStream, std::net::SocketAddr, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server_side, peer) = listener.accept().unwrap();
    (client, peer, server_side)
}

// ── Scenario 1: envelope + USB encapsulation round trip ────────────────────

// The spec's 48-byte figure covers header + data only (36 + 4); this
// implementation's URB codec also carries a 4-byte sum-checksum trailer
// inside the payload (see xoe_core::usb's doc comment for the envelope vs.
// URB checksum resolution), so the wire payload here is 44 bytes. Both the
// header+data portion and the full round trip are verified explicitly.
#[test]
fn scenario_envelope_usb_encapsulation_round_trips() {
    let header = UrbHeader {
        command: Command::Submit.into(),
        flags: 0,
        seqnum: 7,
        device_id: 0x04A9_31C0,
        endpoint: 0x81,
        transfer_type: TransferType::Bulk as u8,
        reserved: 0,
        transfer_length: 4,
        actual_length: 4,
        status: 0,
        setup: [0; SETUP_LEN],
    };
    let data = [0xDE, 0xAD, 0xBE, 0xEF];
    let urb_payload = usb::encapsulate(&header, &data).unwrap();
    assert_eq!(usb::HEADER_LEN + data.len(), 40);

    let packet = Packet::new(ProtocolId::Usb, 1, urb_payload);
    let bytes = packet.to_bytes().unwrap();

    let mut cursor = std::io::Cursor::new(bytes);
    let recovered = envelope::recv_packet(&mut cursor).unwrap();
    assert_eq!(recovered.protocol_id, u16::from(ProtocolId::Usb));
    assert_eq!(recovered.protocol_version, 1);

    let (recovered_header, recovered_data) = usb::decapsulate(&recovered.payload).unwrap();
    assert_eq!(recovered_header, header);
    assert_eq!(recovered_data, &data);
}

/// Flipping any payload bit must surface as ChecksumMismatch at the
/// envelope layer, over a real socket rather than an in-process pipe.
#[test]
fn envelope_bit_flip_over_a_real_socket_is_rejected() {
    let (client, _peer, server_side) = loopback_pair();
    let mut client = client;
    let mut server_side = server_side;

    let packet = Packet::new(ProtocolId::Raw, 1, vec![1, 2, 3, 4]);
    let mut bytes = packet.to_bytes().unwrap();
    bytes[envelope::HEADER_LEN] ^= 0x01;

    let writer = std::thread::spawn(move || {
        use std::io::Write;
        client.write_all(&bytes).unwrap();
    });

    let result = envelope::recv_packet(&mut server_side);
    writer.join().unwrap();
    assert!(matches!(result, Err(xoe_core::XoeError::ChecksumMismatch)));
}

// ── Scenario 2: NBD read of a zero-length export ────────────────────────────

#[test]
fn scenario_nbd_zero_length_export_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    std::fs::write(&path, []).unwrap();

    let backend: Arc<dyn BlockBackend> = Arc::new(FileBackend::open(&path, false, 512).unwrap());
    assert_eq!(backend.get_size(), 0);

    let (mut client, _peer, server_side) = loopback_pair();
    let session_thread = std::thread::spawn(move || {
        let mut session = NbdSession::new(server_side, backend, "empty");
        session.run().unwrap();
    });

    // Client side of the handshake, driven by hand over the real socket.
    use std::io::{Read, Write};

    let mut greeting = [0u8; 18];
    client.read_exact(&mut greeting).unwrap();
    client.write_all(&0u32.to_be_bytes()).unwrap(); // client flags

    client.write_all(&IHAVEOPT.to_be_bytes()).unwrap();
    client.write_all(&NBD_OPT_EXPORT_NAME.to_be_bytes()).unwrap();
    let name = b"empty";
    client.write_all(&(name.len() as u32).to_be_bytes()).unwrap();
    client.write_all(name).unwrap();

    let mut export_size = [0u8; 8];
    client.read_exact(&mut export_size).unwrap();
    assert_eq!(u64::from_be_bytes(export_size), 0);
    let mut flags = [0u8; 2];
    client.read_exact(&mut flags).unwrap();
    let mut reserved = [0u8; 124];
    client.read_exact(&mut reserved).unwrap();
    assert_eq!(reserved, [0u8; 124]);

    // READ length=0 offset=0
    client.write_all(&nbd::REQUEST_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&0u16.to_be_bytes()).unwrap();
    client.write_all(&(RequestType::Read as u16).to_be_bytes()).unwrap();
    client.write_all(&1u64.to_be_bytes()).unwrap(); // cookie
    client.write_all(&0u64.to_be_bytes()).unwrap(); // offset
    client.write_all(&0u32.to_be_bytes()).unwrap(); // length

    let mut reply = [0u8; 16];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(u32::from_be_bytes(reply[0..4].try_into().unwrap()), nbd::SIMPLE_REPLY_MAGIC);
    assert_eq!(u32::from_be_bytes(reply[4..8].try_into().unwrap()), 0);
    assert_eq!(u64::from_be_bytes(reply[8..16].try_into().unwrap()), 1);

    // DISC
    client.write_all(&nbd::REQUEST_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&0u16.to_be_bytes()).unwrap();
    client.write_all(&(RequestType::Disc as u16).to_be_bytes()).unwrap();
    client.write_all(&2u64.to_be_bytes()).unwrap();
    client.write_all(&0u64.to_be_bytes()).unwrap();
    client.write_all(&0u32.to_be_bytes()).unwrap();

    session_thread.join().unwrap();
}

// ── Scenario 3: NBD write past end of device ────────────────────────────────

#[test]
fn scenario_nbd_write_past_end_reports_eio_and_stays_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();

    let backend: Arc<dyn BlockBackend> = Arc::new(FileBackend::open(&path, false, 512).unwrap());

    let (mut client, _peer, server_side) = loopback_pair();
    let session_thread = std::thread::spawn(move || {
        let mut session = NbdSession::new(server_side, backend, "disk0");
        session.run().unwrap();
    });

    use std::io::{Read, Write};
    let mut greeting = [0u8; 18];
    client.read_exact(&mut greeting).unwrap();
    client.write_all(&0u32.to_be_bytes()).unwrap();
    client.write_all(&IHAVEOPT.to_be_bytes()).unwrap();
    client.write_all(&NBD_OPT_EXPORT_NAME.to_be_bytes()).unwrap();
    let name = b"disk0";
    client.write_all(&(name.len() as u32).to_be_bytes()).unwrap();
    client.write_all(name).unwrap();
    let mut opt_reply = [0u8; 8 + 2 + 124];
    client.read_exact(&mut opt_reply).unwrap();

    // WRITE 4 bytes at offset 4094 on a 4096-byte backend: past end.
    client.write_all(&nbd::REQUEST_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&0u16.to_be_bytes()).unwrap();
    client.write_all(&(RequestType::Write as u16).to_be_bytes()).unwrap();
    client.write_all(&1u64.to_be_bytes()).unwrap();
    client.write_all(&4094u64.to_be_bytes()).unwrap();
    client.write_all(&4u32.to_be_bytes()).unwrap();
    client.write_all(b"wxyz").unwrap();

    let mut reply = [0u8; 16];
    client.read_exact(&mut reply).unwrap();
    let error = u32::from_be_bytes(reply[4..8].try_into().unwrap());
    assert_eq!(error, u32::from(xoe_core::error::NbdErrorCode::EIo));

    // Connection remains open: a second, in-bounds write still succeeds.
    client.write_all(&nbd::REQUEST_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&0u16.to_be_bytes()).unwrap();
    client.write_all(&(RequestType::Write as u16).to_be_bytes()).unwrap();
    client.write_all(&2u64.to_be_bytes()).unwrap();
    client.write_all(&0u64.to_be_bytes()).unwrap();
    client.write_all(&4u32.to_be_bytes()).unwrap();
    client.write_all(b"okok").unwrap();

    let mut reply2 = [0u8; 16];
    client.read_exact(&mut reply2).unwrap();
    assert_eq!(u32::from_be_bytes(reply2[4..8].try_into().unwrap()), 0);

    // DISC to let the session thread finish.
    client.write_all(&nbd::REQUEST_MAGIC.to_be_bytes()).unwrap();
    client.write_all(&0u16.to_be_bytes()).unwrap();
    client.write_all(&(RequestType::Disc as u16).to_be_bytes()).unwrap();
    client.write_all(&3u64.to_be_bytes()).unwrap();
    client.write_all(&0u64.to_be_bytes()).unwrap();
    client.write_all(&0u32.to_be_bytes()).unwrap();

    session_thread.join().unwrap();
}

// ── Scenario 4: USB registration with auth ──────────────────────────────────

#[test]
fn scenario_usb_registration_with_auth() {
    let secret = b"hunter2".to_vec();
    let whitelist = ClassWhitelist::new(vec![0x08]);
    let router = UsbRouter::new(whitelist, secret.clone());

    let (client, addr, server_side) = loopback_pair();
    let device_id = 0x0781_5567;
    let device_class = 0x08;

    let register_header = UrbHeader {
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
        setup: [0; SETUP_LEN],
    };
    let payload = usb::encapsulate(&register_header, &[]).unwrap();
    let reply = router.handle_urb(&payload, addr, &server_side).unwrap().unwrap();
    let (reply_header, challenge_bytes) = usb::decapsulate(&reply.payload).unwrap();
    assert_eq!(reply_header.status, usb::STATUS_AUTH_REQUIRED);
    assert_eq!(challenge_bytes.len(), CHALLENGE_LEN);

    let mut challenge = [0u8; CHALLENGE_LEN];
    challenge.copy_from_slice(challenge_bytes);
    let response = usb_auth::compute_response(&secret, &challenge, device_id, device_class);

    let auth_header = UrbHeader {
        command: Command::RetAuth.into(),
        flags: 0,
        seqnum: 2,
        device_id,
        endpoint: device_class,
        transfer_type: 0,
        reserved: 0,
        transfer_length: response.len() as u32,
        actual_length: response.len() as u32,
        status: 0,
        setup: [0; SETUP_LEN],
    };
    let auth_payload = usb::encapsulate(&auth_header, &response).unwrap();
    let reply = router.handle_urb(&auth_payload, addr, &server_side).unwrap().unwrap();
    let (reply_header, _) = usb::decapsulate(&reply.payload).unwrap();
    assert_eq!(reply_header.status, 0);

    drop(client);
}

// ── Scenario 5: USB class blocked ────────────────────────────────────────────

#[test]
fn scenario_usb_class_blocked_consumes_no_slot() {
    let whitelist = ClassWhitelist::new(vec![0x08]);
    let router = UsbRouter::new(whitelist, Vec::new());

    let (client, addr, server_side) = loopback_pair();

    let header = UrbHeader {
        command: Command::Register.into(),
        flags: 0,
        seqnum: 1,
        device_id: 0x1111_2222,
        endpoint: 0x03, // HID, not in the whitelist
        transfer_type: 0,
        reserved: 0,
        transfer_length: 0,
        actual_length: 0,
        status: 0,
        setup: [0; SETUP_LEN],
    };
    let payload = usb::encapsulate(&header, &[]).unwrap();
    let reply = router.handle_urb(&payload, addr, &server_side).unwrap().unwrap();
    let (reply_header, _) = usb::decapsulate(&reply.payload).unwrap();
    assert_eq!(reply_header.status, -3);

    // No slot consumed: unregistering the never-registered device reports not found.
    let unregister_header = UrbHeader {
        command: Command::Unregister.into(),
        ..header
    };
    let unregister_payload = usb::encapsulate(&unregister_header, &[]).unwrap();
    let reply = router.handle_urb(&unregister_payload, addr, &server_side).unwrap().unwrap();
    let (reply_header, _) = usb::decapsulate(&reply.payload).unwrap();
    assert_eq!(reply_header.status, -5);

    drop(client);
}

// ── Scenario 6: pool exhaustion ──────────────────────────────────────────────

#[test]
fn scenario_pool_exhaustion_rejects_beyond_capacity() {
    let pool = ConnectionPool::new(2);

    let (client_a, peer_a, server_a) = loopback_pair();
    let (client_b, peer_b, server_b) = loopback_pair();
    let (client_c, peer_c, server_c) = loopback_pair();

    let slot_a = pool.acquire(server_a, peer_a);
    let slot_b = pool.acquire(server_b, peer_b);
    let slot_c = pool.acquire(server_c, peer_c);

    assert!(slot_a.is_some());
    assert!(slot_b.is_some());
    assert!(slot_c.is_none(), "third connection should be rejected, pool at capacity");
    assert_eq!(pool.active_count(), 2);

    drop((client_a, client_b, client_c));
}
