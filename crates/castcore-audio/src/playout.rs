//! Audio playout watermark state machine.
//!
//! Feeds arriving fragments into a `Kind::Audio` [`FrameRing`], then on a
//! fixed tick decides whether to hold (`buffering`), decode-and-submit the
//! next ready frame, or drop frames (`flush_triggered`) to recover from a
//! backlog, entirely in terms of bytes sitting between the reassembly
//! table and the device queue.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use castcore_protocol::fragment::Fragment;
use castcore_protocol::ring::{audio_ring_config, FragmentOutcome, FrameRing, NackAction};
use castcore_protocol::{CoreError, FrameId};

use crate::decoder::AudioDecoder;
use crate::sink::DeviceSink;

/// Below this many pending bytes, playout stops and waits to refill.
pub const LOWER_WATERMARK_BYTES: usize = 18_000;
/// Once buffering, playout resumes after crossing this many pending bytes.
pub const TARGET_WATERMARK_BYTES: usize = 28_000;
/// Above this many queued bytes, playout starts dropping frames to recover.
pub const UPPER_WATERMARK_BYTES: usize = 59_000;

/// Audio frames this small arrive as 1-3 fragments; on such a small frame,
/// seeing only its last index means the earlier ones are either lost or
/// still in flight, and waiting for them would blow the playout budget.
const SHORT_FRAME_MAX_INDICES: u16 = 3;

const OPENED_FRAME_HISTORY: usize = 64;

/// Owns the reassembly ring, decoder, and device sink for one audio stream
/// and drives them through the watermark state machine.
pub struct AudioPlayout<S: DeviceSink> {
    ring: FrameRing,
    decoder: AudioDecoder,
    sink: S,
    buffering: bool,
    flush_triggered: bool,
    refresh_pending: bool,
    pending_frames: VecDeque<(FrameId, Vec<u8>)>,
    opened_frames: VecDeque<FrameId>,
    opened_set: HashSet<FrameId>,
}

impl<S: DeviceSink> AudioPlayout<S> {
    pub fn new(sink: S) -> Result<Self, CoreError> {
        let decoder = AudioDecoder::new(sink.sample_rate_hz())?;
        Ok(Self {
            ring: FrameRing::new(audio_ring_config()),
            decoder,
            sink,
            buffering: true,
            flush_triggered: false,
            refresh_pending: false,
            pending_frames: VecDeque::new(),
            opened_frames: VecDeque::new(),
            opened_set: HashSet::new(),
        })
    }

    pub fn buffering(&self) -> bool {
        self.buffering
    }

    /// Adopt a sample rate newly announced by the server. The decoder is
    /// rebuilt immediately; the device is rebuilt lazily on the next
    /// `tick`, so intake of arriving fragments is never blocked on it.
    pub fn note_server_sample_rate(&mut self, hz: u32) -> Result<(), CoreError> {
        if hz != self.decoder.sample_rate_hz() {
            self.decoder = AudioDecoder::new(hz)?;
            self.refresh_pending = true;
        }
        Ok(())
    }

    /// Feed one received fragment into the ring, applying the short-frame
    /// intake short-circuit before handing it to `FrameRing::on_fragment`.
    pub fn on_fragment(&mut self, frag: Fragment) -> Result<FragmentOutcome, CoreError> {
        let first_seen = self.note_first_sight(frag.frame_id);
        if first_seen
            && frag.num_indices <= SHORT_FRAME_MAX_INDICES
            && frag.index + 1 == frag.num_indices
        {
            for idx in 0..frag.index {
                let filler = Fragment {
                    index: idx,
                    payload_size: 0,
                    data: Vec::new(),
                    ..frag.clone()
                };
                self.ring.on_fragment(filler)?;
            }
        }

        let outcome = self.ring.on_fragment(frag)?;
        if let FragmentOutcome::FrameReady { frame_id, data } = &outcome {
            self.pending_frames.push_back((*frame_id, data.clone()));
        }
        Ok(outcome)
    }

    fn note_first_sight(&mut self, frame_id: FrameId) -> bool {
        if self.opened_set.contains(&frame_id) {
            return false;
        }
        self.opened_set.insert(frame_id);
        self.opened_frames.push_back(frame_id);
        if self.opened_frames.len() > OPENED_FRAME_HISTORY {
            if let Some(old) = self.opened_frames.pop_front() {
                self.opened_set.remove(&old);
            }
        }
        true
    }

    pub fn poll_nacks(&mut self, now: Instant) -> Vec<NackAction> {
        self.ring.poll_nacks(now)
    }

    /// One tick of the playout loop. Applies, in order: device refresh,
    /// watermark-gated buffering, overflow-triggered frame dropping, then
    /// a single decode-and-submit if a frame is ready and playout is live.
    pub fn tick(&mut self) -> Result<(), CoreError> {
        if self.refresh_pending {
            self.sink.reopen(self.decoder.sample_rate_hz())?;
            self.refresh_pending = false;
        }

        let queued = self.sink.queued_bytes();
        let pending_decoded: usize = self.pending_frames.iter().map(|(_, d)| d.len()).sum();
        let pending_bytes = queued + pending_decoded;

        if pending_bytes < LOWER_WATERMARK_BYTES {
            self.buffering = true;
        }
        if self.buffering {
            if pending_bytes < TARGET_WATERMARK_BYTES {
                return Ok(());
            }
            self.buffering = false;
        }

        if queued > UPPER_WATERMARK_BYTES {
            self.flush_triggered = true;
        }
        if self.flush_triggered {
            if queued > TARGET_WATERMARK_BYTES {
                self.pending_frames.pop_front();
                return Ok(());
            }
            self.flush_triggered = false;
        }

        let Some((frame_id, data)) = self.pending_frames.pop_front() else {
            return Ok(());
        };
        let pcm = self.decoder.decode(&data)?;
        self.sink.submit(&pcm);
        self.ring.mark_rendered(frame_id);
        Ok(())
    }
}
