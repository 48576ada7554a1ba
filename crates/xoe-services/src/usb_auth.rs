//! Component H — the USB client-registration authenticator.
//!
//! Challenge/response over HMAC-SHA-256, plus the device-class whitelist
//! policy that gates `CMD_REGISTER` before authentication even begins.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Size of both the challenge and the HMAC response.
pub const CHALLENGE_LEN: usize = 32;

/// USB-HID, blocked by default when the whitelist is empty.
const USB_CLASS_HID: u8 = 0x03;

/// Whitelist sentinel meaning "allow any class".
const CLASS_ANY: u8 = 0xFF;

/// Generate a fresh 32-byte challenge from the platform's secure RNG.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Compute `HMAC-SHA-256(secret, challenge || device_id_be32 || device_class)`.
pub fn compute_response(secret: &[u8], challenge: &[u8; CHALLENGE_LEN], device_id: u32, device_class: u8) -> [u8; CHALLENGE_LEN] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(challenge);
    mac.update(&device_id.to_be_bytes());
    mac.update(&[device_class]);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(&result);
    out
}

/// Verify a claimed response in constant time.
pub fn verify_response(
    secret: &[u8],
    challenge: &[u8; CHALLENGE_LEN],
    device_id: u32,
    device_class: u8,
    claimed_response: &[u8],
) -> bool {
    let expected = compute_response(secret, challenge, device_id, device_class);
    expected.ct_eq(claimed_response).into()
}

/// Policy over the set of USB device classes allowed to register.
///
/// An empty whitelist blocks HID (0x03) and allows everything else. A
/// non-empty whitelist only allows the classes it names, with `0xFF`
/// meaning "any class".
#[derive(Debug, Clone, Default)]
pub struct ClassWhitelist {
    classes: Vec<u8>,
}

impl ClassWhitelist {
    pub fn new(classes: Vec<u8>) -> Self {
        Self { classes }
    }

    pub fn is_allowed(&self, device_class: u8) -> bool {
        if self.classes.is_empty() {
            return device_class != USB_CLASS_HID;
        }
        self.classes.iter().any(|&c| c == CLASS_ANY || c == device_class)
    }
}

/// Whether authentication is active at all (spec: empty secret disables it).
pub fn auth_enabled(secret: &[u8]) -> bool {
    !secret.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_round_trips_through_verify() {
        let secret = b"shared-secret";
        let challenge = generate_challenge();
        let response = compute_response(secret, &challenge, 0x1234_5678, 0x02);
        assert!(verify_response(secret, &challenge, 0x1234_5678, 0x02, &response));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let challenge = generate_challenge();
        let response = compute_response(b"secret-a", &challenge, 1, 2);
        assert!(!verify_response(b"secret-b", &challenge, 1, 2, &response));
    }

    #[test]
    fn wrong_device_id_fails_verification() {
        let secret = b"shared-secret";
        let challenge = generate_challenge();
        let response = compute_response(secret, &challenge, 1, 2);
        assert!(!verify_response(secret, &challenge, 2, 2, &response));
    }

    #[test]
    fn empty_whitelist_blocks_hid_only() {
        let whitelist = ClassWhitelist::default();
        assert!(!whitelist.is_allowed(0x03));
        assert!(whitelist.is_allowed(0x08));
        assert!(whitelist.is_allowed(0x02));
    }

    #[test]
    fn nonempty_whitelist_restricts_to_listed_classes() {
        let whitelist = ClassWhitelist::new(vec![0x08, 0x02]);
        assert!(whitelist.is_allowed(0x08));
        assert!(!whitelist.is_allowed(0x03));
        assert!(!whitelist.is_allowed(0x09));
    }

    #[test]
    fn any_sentinel_allows_every_class() {
        let whitelist = ClassWhitelist::new(vec![0xFF]);
        assert!(whitelist.is_allowed(0x03));
        assert!(whitelist.is_allowed(0x09));
    }

    #[test]
    fn empty_secret_disables_auth() {
        assert!(!auth_enabled(b""));
        assert!(auth_enabled(b"x"));
    }
}
