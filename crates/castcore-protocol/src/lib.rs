//! Wire format, reassembly, and control-plane types shared by every other
//! crate in the workspace — the non-cryptographic half of the media
//! transport core.
//!
//! `castcore-crypto` wraps the bytes this crate produces in an encrypted,
//! authenticated datagram; `castcore-audio`/`castcore-video` consume the
//! `FrameReady` events `ring::FrameRing` emits; `castcore-client` wires the
//! sockets, sync loops, and congestion controller together.

pub mod bitset;
pub mod codec;
pub mod congestion;
pub mod error;
pub mod fec;
pub mod fragment;
pub mod messages;
pub mod ring;
pub mod types;

pub use error::CoreError;
pub use fragment::{Fragment, MAX_PAYLOAD};
pub use messages::{ClientMessage, ServerMessage, SessionBinding};
pub use ring::{FrameRing, NackAction, RingBufferConfig};
pub use types::{FrameId, FragmentIndex, Kind, SessionId};
