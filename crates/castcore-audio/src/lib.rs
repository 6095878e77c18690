//! Decoded-PCM audio playout: an opaque Opus decoder collaborator, a
//! `cpal`-backed device sink, and the watermark state machine that sits
//! between them and a `Kind::Audio` frame ring.

pub mod decoder;
pub mod device;
pub mod playout;
pub mod sink;

pub use decoder::AudioDecoder;
pub use playout::{AudioPlayout, LOWER_WATERMARK_BYTES, TARGET_WATERMARK_BYTES, UPPER_WATERMARK_BYTES};
pub use sink::{CpalSink, DeviceSink};
