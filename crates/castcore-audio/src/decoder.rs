//! Opaque Opus decoder collaborator: `decode(bytes) -> frame`.
//!
//! Generalized from a fixed 48kHz assumption to whatever sample rate the
//! server announces over `ServerMessage::AudioFrequency`.

use audiopus::coder::Decoder as OpusDecoder;
use audiopus::packet::Packet;
use audiopus::{Channels, MutSignals, SampleRate};

use castcore_protocol::CoreError;

/// Samples per 20ms Opus frame at 48kHz mono; scaled for other rates.
const OPUS_FRAME_SIZE_48K: usize = 960;

fn sample_rate_enum(hz: u32) -> Result<SampleRate, CoreError> {
    match hz {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        other => Err(CoreError::DecodeError(format!(
            "unsupported Opus sample rate {other}"
        ))),
    }
}

fn frame_size_for(hz: u32) -> usize {
    (OPUS_FRAME_SIZE_48K as u64 * hz as u64 / 48_000) as usize
}

/// Wraps the Opus decoder for one stream. Reconstructed whenever the
/// server-announced sample rate changes.
pub struct AudioDecoder {
    inner: OpusDecoder,
    sample_rate_hz: u32,
    frame_size: usize,
}

impl AudioDecoder {
    pub fn new(sample_rate_hz: u32) -> Result<Self, CoreError> {
        let rate = sample_rate_enum(sample_rate_hz)?;
        let inner = OpusDecoder::new(rate, Channels::Mono)
            .map_err(|e| CoreError::DecodeError(format!("opus decoder init failed: {e}")))?;
        Ok(Self {
            inner,
            sample_rate_hz,
            frame_size: frame_size_for(sample_rate_hz),
        })
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    /// Decode one Opus packet into PCM f32 samples.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<f32>, CoreError> {
        if opus_data.is_empty() {
            return self.decode_lost();
        }
        let mut output = vec![0.0f32; self.frame_size];
        let packet = Packet::try_from(opus_data)
            .map_err(|e| CoreError::DecodeError(format!("invalid opus packet: {e}")))?;
        let signals = MutSignals::try_from(&mut output)
            .map_err(|e| CoreError::DecodeError(format!("opus signal buffer invalid: {e}")))?;
        let samples = self
            .inner
            .decode_float(Some(packet), signals, false)
            .map_err(|e| CoreError::DecodeError(format!("opus decode failed: {e}")))?;
        output.truncate(samples);
        Ok(output)
    }

    /// Packet-loss concealment: synthesize comfort noise/interpolation for
    /// a fragment that was never recovered (e.g. the audio NACK engine gave
    /// up before the deadline).
    pub fn decode_lost(&mut self) -> Result<Vec<f32>, CoreError> {
        let mut output = vec![0.0f32; self.frame_size];
        let signals = MutSignals::try_from(&mut output)
            .map_err(|e| CoreError::DecodeError(format!("opus signal buffer invalid: {e}")))?;
        let samples = self
            .inner
            .decode_float(None, signals, false)
            .map_err(|e| CoreError::DecodeError(format!("opus PLC failed: {e}")))?;
        output.truncate(samples);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_sample_rate() {
        assert!(AudioDecoder::new(44_100).is_err());
    }

    #[test]
    fn constructs_at_each_supported_rate() {
        for rate in [8_000, 12_000, 16_000, 24_000, 48_000] {
            assert!(AudioDecoder::new(rate).is_ok(), "rate={rate}");
        }
    }

    #[test]
    fn packet_loss_concealment_produces_samples() {
        let mut dec = AudioDecoder::new(48_000).unwrap();
        let pcm = dec.decode_lost().unwrap();
        assert!(!pcm.is_empty());
    }
}
