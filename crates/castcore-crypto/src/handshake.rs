//! Mutual proof-of-key-possession handshake.
//!
//! Proves both peers hold the same pre-shared 16-byte key without ever
//! transmitting it:
//!
//! 1. Each peer sends a random 16-byte IV and a zeroed 32-byte signature
//!    slot (`HandshakeMessage::default_for(iv)`).
//! 2. Each peer signs the *peer's* IV with `HMAC(key, peer_iv || key)` and
//!    returns it (`sign_peer_iv`).
//! 3. Each peer verifies the returned signature against its own IV
//!    (`verify_own_signature`); a mismatch aborts the connection.
//!
//! The transport side (socket send/recv with the 1s-per-round timeout) is
//! `castcore-client`'s job; this module only computes the values exchanged.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use castcore_protocol::CoreError;

pub const IV_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// One leg of the handshake exchange: a random IV plus (eventually) its
/// signature from the peer.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeMessage {
    pub iv: [u8; IV_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl HandshakeMessage {
    /// The first message of a round: a fresh IV with a zeroed signature
    /// slot.
    pub fn fresh() -> Self {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        Self {
            iv,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    pub fn to_bytes(&self) -> [u8; IV_LEN + SIGNATURE_LEN] {
        let mut buf = [0u8; IV_LEN + SIGNATURE_LEN];
        buf[..IV_LEN].copy_from_slice(&self.iv);
        buf[IV_LEN..].copy_from_slice(&self.signature);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, CoreError> {
        if buf.len() != IV_LEN + SIGNATURE_LEN {
            return Err(CoreError::PacketTooShort {
                expected: IV_LEN + SIGNATURE_LEN,
                got: buf.len(),
            });
        }
        let mut iv = [0u8; IV_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        iv.copy_from_slice(&buf[..IV_LEN]);
        signature.copy_from_slice(&buf[IV_LEN..]);
        Ok(Self { iv, signature })
    }
}

/// Sign the peer's IV with `HMAC(key, peer_iv || key)`, producing the
/// value we send back to them in step 2.
pub fn sign_peer_iv(key: &[u8; 16], peer_iv: &[u8; IV_LEN]) -> [u8; SIGNATURE_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(peer_iv);
    mac.update(key);
    let full = mac.finalize().into_bytes();
    let mut sig = [0u8; SIGNATURE_LEN];
    sig.copy_from_slice(&full[..SIGNATURE_LEN]);
    sig
}

/// Verify a signature the peer returned against the IV we originally sent
/// them (step 3). Constant-time comparison via `hmac::Mac::verify_slice`.
pub fn verify_own_signature(
    key: &[u8; 16],
    own_iv: &[u8; IV_LEN],
    returned_signature: &[u8; SIGNATURE_LEN],
) -> Result<(), CoreError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(own_iv);
    mac.update(key);
    mac.verify_slice(returned_signature)
        .map_err(|_| CoreError::HandshakeFailed("key-possession proof mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keys_complete_handshake() {
        let key = [7u8; 16];
        let mine = HandshakeMessage::fresh();
        let theirs = HandshakeMessage::fresh();

        // I sign their IV, they sign mine.
        let my_signature_of_theirs = sign_peer_iv(&key, &theirs.iv);
        let their_signature_of_mine = sign_peer_iv(&key, &mine.iv);

        assert!(verify_own_signature(&key, &mine.iv, &their_signature_of_mine).is_ok());
        assert!(verify_own_signature(&key, &theirs.iv, &my_signature_of_theirs).is_ok());
    }

    #[test]
    fn mismatched_keys_fail_handshake() {
        let key_a = [1u8; 16];
        let key_b = [2u8; 16];
        let mine = HandshakeMessage::fresh();

        let their_signature = sign_peer_iv(&key_b, &mine.iv);
        assert!(verify_own_signature(&key_a, &mine.iv, &their_signature).is_err());
    }

    #[test]
    fn message_byte_roundtrip() {
        let msg = HandshakeMessage::fresh();
        let bytes = msg.to_bytes();
        let decoded = HandshakeMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.iv, msg.iv);
        assert_eq!(decoded.signature, msg.signature);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(HandshakeMessage::from_bytes(&[0u8; 10]).is_err());
    }
}
