//! Datagram encryption and key-possession handshake.
//!
//! Every fragment produced by `castcore-protocol::fragment` is wrapped in a
//! [`datagram::encrypt`]ed wire packet before it leaves this process, and
//! unwrapped by [`datagram::decrypt`] on receipt. [`handshake`] proves both
//! ends of a connection hold the same pre-shared key before any media
//! traffic is trusted; [`key`] parses that key from its hex CLI form.

pub mod datagram;
pub mod handshake;
pub mod key;

pub use datagram::{aes_cbc_ciphertext_len, decrypt, encrypt, IV_LEN, KEY_LEN, TAG_LEN};
pub use handshake::{sign_peer_iv, verify_own_signature, HandshakeMessage};
pub use key::parse_preshared_key;
