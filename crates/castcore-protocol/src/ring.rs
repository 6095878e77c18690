//! Per-kind frame ring buffer, receive-path reassembly table and NACK engine.
//!
//! Each [`Kind`] gets its own [`FrameRing`]: a fixed number of [`FrameSlot`]s
//! indexed by `frame_id % capacity`, each walking the state machine
//! `Empty -> Open -> Complete -> Rendered -> Empty`. `FrameRing::on_fragment`
//! is the single entry point fed by the unreliable receive loop;
//! `FrameRing::poll_nacks` is polled on a fixed tick to drive retransmit
//! requests, frame-gap recovery, and key-frame escalation without
//! per-fragment timers.

use std::time::{Duration, Instant};

use crate::bitset::FragmentBitset;
use crate::error::CoreError;
use crate::fragment::{defragment, Fragment};
use crate::types::{FrameId, Kind};

/// Tunable constants governing NACK aggressiveness and desync detection.
/// Overridable via the TOML config, hence plain fields rather than
/// `const`s (see DESIGN.md).
#[derive(Debug, Clone, Copy)]
pub struct RingBufferConfig {
    /// Number of frame slots kept per kind.
    pub capacity: usize,
    /// Maximum number of fragment indices NACKed across all slots per poll
    /// tick (audio uses 1).
    pub max_nacked: usize,
    /// `max_received_id - last_rendered_id` beyond which a key frame is
    /// requested while nothing is currently rendering.
    pub max_unsynced_frames: i64,
    /// Same threshold, but tolerated while a frame is actively rendering.
    pub max_unsynced_frames_render: i64,
    /// Total missing indices across the in-flight window beyond which a
    /// key frame is requested even if no single slot has desynced.
    pub max_missing_packets: usize,
    /// A slot that has been `Open` with missing fragments for this many
    /// poll ticks escalates from a plain NACK to a key-frame request.
    pub max_missing_ticks: u32,
    /// How long a slot may sit `Open` before its fragments are considered
    /// unrecoverable and the slot is force-cleared.
    pub slot_timeout: Duration,
    /// Round-trip estimate used both as the minimum age before a slot's
    /// oldest unreceived index is NACKed and as the base NACK backoff unit.
    pub latency: Duration,
    /// Minimum spacing between key-frame requests.
    pub keyframe_request_interval: Duration,
    /// Minimum spacing between frame-gap NACKs (one missing-id at a time).
    pub missing_frame_nack_interval: Duration,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_nacked: 64,
            max_unsynced_frames: 10,
            max_unsynced_frames_render: 12,
            max_missing_packets: 20,
            max_missing_ticks: 6,
            slot_timeout: Duration::from_millis(500),
            latency: Duration::from_millis(40),
            keyframe_request_interval: Duration::from_millis(1500),
            missing_frame_nack_interval: Duration::from_millis(40),
        }
    }
}

/// Audio rings use a tighter global NACK cap than video (MAX_NACKED=1)
/// since an audio frame has at most three fragments.
pub fn audio_ring_config() -> RingBufferConfig {
    RingBufferConfig {
        max_nacked: 1,
        ..RingBufferConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Open,
    Complete,
    Rendered,
}

struct FrameSlot {
    state: SlotState,
    frame_id: FrameId,
    num_orig: usize,
    num_fec: usize,
    fragment_size: usize,
    fragments: Vec<Option<Fragment>>,
    arrived: FragmentBitset,
    nacked: FragmentBitset,
    opened_at: Instant,
    last_nack_at: Option<Instant>,
    num_times_nacked: u32,
    last_nacked_index: i64,
    missing_ticks: u32,
}

impl FrameSlot {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            frame_id: 0,
            num_orig: 0,
            num_fec: 0,
            fragment_size: 0,
            fragments: Vec::new(),
            arrived: FragmentBitset::new(),
            nacked: FragmentBitset::new(),
            opened_at: Instant::now(),
            last_nack_at: None,
            num_times_nacked: 0,
            last_nacked_index: -1,
            missing_ticks: 0,
        }
    }

    fn open(&mut self, frame_id: FrameId, num_orig: usize, num_fec: usize, fragment_size: usize) {
        self.state = SlotState::Open;
        self.frame_id = frame_id;
        self.num_orig = num_orig;
        self.num_fec = num_fec;
        self.fragment_size = fragment_size;
        self.fragments.clear();
        self.fragments.resize(num_orig + num_fec, None);
        self.arrived.clear();
        self.nacked.clear();
        self.opened_at = Instant::now();
        self.last_nack_at = None;
        self.num_times_nacked = 0;
        self.last_nacked_index = -1;
        self.missing_ticks = 0;
    }

    fn reset(&mut self) {
        *self = FrameSlot::empty();
    }

    fn is_complete(&self) -> bool {
        let num_original_received = self.fragments[..self.num_orig]
            .iter()
            .filter(|f| f.is_some())
            .count();
        if num_original_received == self.num_orig {
            return true;
        }
        let num_fec_received = self.fragments[self.num_orig..]
            .iter()
            .filter(|f| f.is_some())
            .count();
        num_original_received + num_fec_received >= self.num_orig
    }

    fn missing_count(&self) -> usize {
        self.fragments.iter().filter(|f| f.is_none()).count()
    }

    /// Scans forward from `last_nacked_index + 1`, capped to one
    /// newly-nacked index per pass, with a back-off of
    /// `latency + latency * num_times_nacked` between NACKs for the same
    /// frame.
    fn next_nack(&mut self, now: Instant, latency: Duration) -> Option<u16> {
        if self.opened_at.elapsed() < latency {
            return None;
        }
        if let Some(last) = self.last_nack_at {
            let backoff = latency + latency * self.num_times_nacked;
            if now.duration_since(last) < backoff {
                return None;
            }
        }
        let start = (self.last_nacked_index + 1).max(0) as usize;
        let idx = (start..self.fragments.len())
            .chain(0..start)
            .find(|&i| self.fragments[i].is_none() && !self.nacked.is_set(i))?;
        self.nacked.set(idx);
        self.last_nacked_index = idx as i64;
        self.last_nack_at = Some(now);
        self.num_times_nacked += 1;
        Some(idx as u16)
    }
}

/// Outcome of feeding one fragment into the ring.
#[derive(Debug)]
pub enum FragmentOutcome {
    /// The fragment was accepted but its frame is not yet complete.
    Pending,
    /// The fragment was a duplicate or belonged to an already-rendered/
    /// stale frame.
    StaleDuplicate,
    /// The frame is now complete and has been reassembled into full
    /// application bytes.
    FrameReady { frame_id: FrameId, data: Vec<u8> },
}

/// What the NACK engine wants the caller to send this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackAction {
    /// Ask for specific missing fragments of `frame_id`.
    Nack { frame_id: FrameId, indices: Vec<u16> },
    /// The first packet of `frame_id` was never seen at all, so there is no
    /// `num_indices` to NACK individual fragments against yet.
    MissingFrame { frame_id: FrameId },
    /// Escalate: the server should produce/resend a key frame because a
    /// slot has missed fragments for too many ticks, or the stream has
    /// fallen more than `max_unsynced_frames[_render]` behind.
    IframeRequest,
    /// The stream has desynced badly enough that only a full reset
    /// recovers it.
    StreamReset { last_failed_id: FrameId },
}

/// Tracks render progress for a kind's stream, independent of any one slot.
#[derive(Debug, Clone, Copy)]
struct StreamCursor {
    last_rendered_id: FrameId,
    max_received_id: FrameId,
    waiting_for_keyframe: bool,
    last_keyframe_request: Option<Instant>,
    last_missing_frame_nack: Option<Instant>,
}

impl StreamCursor {
    fn new() -> Self {
        Self {
            last_rendered_id: -1,
            max_received_id: -1,
            waiting_for_keyframe: false,
            last_keyframe_request: None,
            last_missing_frame_nack: None,
        }
    }
}

/// A fixed-capacity ring of frame slots for one [`Kind`].
pub struct FrameRing {
    config: RingBufferConfig,
    slots: Vec<FrameSlot>,
    cursor: StreamCursor,
    rendering: bool,
}

impl FrameRing {
    pub fn new(config: RingBufferConfig) -> Self {
        let slots = (0..config.capacity).map(|_| FrameSlot::empty()).collect();
        Self {
            config,
            slots,
            cursor: StreamCursor::new(),
            rendering: false,
        }
    }

    fn slot_index(&self, frame_id: FrameId) -> usize {
        (frame_id as i64).rem_euclid(self.config.capacity as i64) as usize
    }

    pub fn last_rendered_id(&self) -> FrameId {
        self.cursor.last_rendered_id
    }

    pub fn max_received_id(&self) -> FrameId {
        self.cursor.max_received_id
    }

    pub fn waiting_for_keyframe(&self) -> bool {
        self.cursor.waiting_for_keyframe
    }

    /// Call when the caller starts feeding bitstream into a decoder for a
    /// completed frame, and again with `false` once presented, so the NACK
    /// engine can apply the render-tolerant threshold.
    pub fn set_rendering(&mut self, rendering: bool) {
        self.rendering = rendering;
    }

    /// A fresh key frame arrived; clears the waiting flag.
    pub fn note_keyframe_received(&mut self, frame_id: FrameId) {
        self.cursor.waiting_for_keyframe = false;
        if frame_id > self.cursor.last_rendered_id {
            self.cursor.last_rendered_id = frame_id - 1;
        }
    }

    /// Feed one received fragment into the ring.
    pub fn on_fragment(&mut self, frag: Fragment) -> Result<FragmentOutcome, CoreError> {
        let frame_id = frag.frame_id;

        if frame_id <= self.cursor.last_rendered_id {
            return Ok(FragmentOutcome::StaleDuplicate);
        }

        let num_orig = frag.num_orig();
        let num_fec = frag.num_fec_indices as usize;
        let fragment_size = frag.data.len().max(1);

        let idx = self.slot_index(frame_id);
        let slot = &mut self.slots[idx];

        match slot.state {
            SlotState::Empty => {
                slot.open(frame_id, num_orig, num_fec, fragment_size);
            }
            SlotState::Open if slot.frame_id == frame_id => {}
            SlotState::Open | SlotState::Complete | SlotState::Rendered => {
                if slot.frame_id == frame_id && slot.state != SlotState::Open {
                    return Ok(FragmentOutcome::StaleDuplicate);
                }
                if frame_id < slot.frame_id {
                    return Ok(FragmentOutcome::StaleDuplicate);
                }
                // A different, newer frame now owns this slot: recycle it.
                slot.open(frame_id, num_orig, num_fec, fragment_size);
            }
        }

        if fragment_size > slot.fragment_size {
            slot.fragment_size = fragment_size;
        }

        let fragment_index = frag.index as usize;
        if fragment_index >= slot.fragments.len() {
            return Err(CoreError::MalformedPacket(format!(
                "fragment index {fragment_index} out of range for frame {frame_id}"
            )));
        }

        let newly_set = slot.arrived.set(fragment_index);
        if !newly_set && slot.fragments[fragment_index].is_some() {
            return Ok(FragmentOutcome::StaleDuplicate);
        }
        slot.fragments[fragment_index] = Some(frag);

        if frame_id > self.cursor.max_received_id {
            self.cursor.max_received_id = frame_id;
        }

        if slot.is_complete() {
            let data = defragment(&slot.fragments, slot.num_orig, slot.num_fec, slot.fragment_size)?;
            slot.state = SlotState::Complete;
            Ok(FragmentOutcome::FrameReady { frame_id, data })
        } else {
            Ok(FragmentOutcome::Pending)
        }
    }

    /// Mark the most recently completed frame as rendered, freeing its
    /// fragment storage and advancing `last_rendered_id`.
    pub fn mark_rendered(&mut self, frame_id: FrameId) {
        let idx = self.slot_index(frame_id);
        let slot = &mut self.slots[idx];
        if slot.frame_id == frame_id && slot.state == SlotState::Complete {
            slot.fragments.clear();
            slot.state = SlotState::Rendered;
        }
        if frame_id > self.cursor.last_rendered_id {
            self.cursor.last_rendered_id = frame_id;
        }
    }

    /// Drive the NACK engine for one tick (called on a fixed period by the
    /// reliable control loop).
    pub fn poll_nacks(&mut self, now: Instant) -> Vec<NackAction> {
        let mut actions = Vec::new();
        let mut budget = self.config.max_nacked;
        let mut total_missing = 0usize;

        for slot in &mut self.slots {
            if slot.state != SlotState::Open {
                continue;
            }

            if slot.opened_at.elapsed() > self.config.slot_timeout * 4 && slot.num_times_nacked > 1 {
                actions.push(NackAction::StreamReset {
                    last_failed_id: slot.frame_id,
                });
                slot.reset();
                continue;
            }
            if slot.opened_at.elapsed() > self.config.slot_timeout {
                slot.reset();
                continue;
            }

            total_missing += slot.missing_count();

            slot.missing_ticks += 1;
            if slot.missing_ticks > self.config.max_missing_ticks {
                actions.push(NackAction::IframeRequest);
                slot.reset();
                continue;
            }

            if budget > 0 {
                if let Some(idx) = slot.next_nack(now, self.config.latency) {
                    actions.push(NackAction::Nack {
                        frame_id: slot.frame_id,
                        indices: vec![idx],
                    });
                    budget -= 1;
                }
            }
        }

        // Frame-gap NACK: the first packet of some id between
        // last_rendered_id and max_received_id was never seen at all, so
        // its slot is still Empty and can't be NACKed by index.
        let gap_due = self
            .cursor
            .last_missing_frame_nack
            .map(|t| now.duration_since(t) >= self.config.missing_frame_nack_interval)
            .unwrap_or(true);
        if gap_due && self.cursor.max_received_id > self.cursor.last_rendered_id + 1 {
            let missing_id = self.cursor.last_rendered_id + 1;
            let idx = self.slot_index(missing_id);
            if self.slots[idx].state == SlotState::Empty {
                actions.push(NackAction::MissingFrame {
                    frame_id: missing_id,
                });
                self.cursor.last_missing_frame_nack = Some(now);
            }
        }

        // Key-frame escalation.
        let unsynced = self.cursor.max_received_id - self.cursor.last_rendered_id;
        let threshold = if self.rendering {
            self.config.max_unsynced_frames_render
        } else {
            self.config.max_unsynced_frames
        };
        let desynced = unsynced > threshold || total_missing > self.config.max_missing_packets;
        if desynced {
            let due = self
                .cursor
                .last_keyframe_request
                .map(|t| now.duration_since(t) >= self.config.keyframe_request_interval)
                .unwrap_or(true);
            if due {
                actions.push(NackAction::IframeRequest);
                self.cursor.last_keyframe_request = Some(now);
                self.cursor.waiting_for_keyframe = true;
            }
        }

        actions
    }

    /// Force a full reset of this kind's ring — used when the caller
    /// decides the stream is unrecoverable (e.g. after `StreamReset`).
    pub fn reset_stream(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.cursor = StreamCursor::new();
    }
}

pub fn ring_for_kind(_kind: Kind, config: RingBufferConfig) -> FrameRing {
    FrameRing::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::fragment_frame;

    fn small_config() -> RingBufferConfig {
        RingBufferConfig {
            capacity: 8,
            max_nacked: 16,
            max_unsynced_frames: 4,
            max_unsynced_frames_render: 6,
            max_missing_packets: 100,
            max_missing_ticks: 2,
            slot_timeout: Duration::from_millis(50),
            latency: Duration::from_millis(1),
            keyframe_request_interval: Duration::from_millis(5),
            missing_frame_nack_interval: Duration::from_millis(1),
        }
    }

    #[test]
    fn completes_frame_once_all_fragments_arrive() {
        let mut ring = FrameRing::new(small_config());
        let payload = vec![7u8; 4000];
        let frags = fragment_frame(&payload, Kind::Video, 1, 512, 0.0, false).unwrap();

        let mut ready = None;
        for frag in frags {
            if let FragmentOutcome::FrameReady { frame_id, data } = ring.on_fragment(frag).unwrap() {
                ready = Some((frame_id, data));
            }
        }
        let (frame_id, data) = ready.expect("frame should complete");
        assert_eq!(frame_id, 1);
        assert_eq!(data, payload);
    }

    #[test]
    fn duplicate_fragment_after_completion_is_stale() {
        let mut ring = FrameRing::new(small_config());
        let payload = vec![1u8; 100];
        let frags = fragment_frame(&payload, Kind::Audio, 2, 512, 0.0, false).unwrap();
        let first = frags[0].clone();
        for frag in frags {
            ring.on_fragment(frag).unwrap();
        }
        ring.mark_rendered(2);
        match ring.on_fragment(first).unwrap() {
            FragmentOutcome::StaleDuplicate => {}
            other => panic!("expected StaleDuplicate, got {other:?}"),
        }
    }

    #[test]
    fn last_rendered_id_is_non_decreasing() {
        let mut ring = FrameRing::new(small_config());
        assert_eq!(ring.last_rendered_id(), -1);
        ring.mark_rendered(-1); // no-op, nothing complete
        assert_eq!(ring.last_rendered_id(), -1);
    }

    #[test]
    fn nack_reports_missing_indices_after_ticks() {
        let mut ring = FrameRing::new(small_config());
        let payload = vec![3u8; 4000];
        let mut frags = fragment_frame(&payload, Kind::Video, 3, 512, 0.0, false).unwrap();
        frags.pop(); // drop the last fragment so the frame never completes

        for frag in frags {
            ring.on_fragment(frag).unwrap();
        }

        std::thread::sleep(Duration::from_millis(5));
        let actions = ring.poll_nacks(Instant::now());
        assert!(actions.iter().any(|a| matches!(a, NackAction::Nack { .. })));
    }

    #[test]
    fn nack_spacing_respects_backoff() {
        let mut ring = FrameRing::new(small_config());
        let payload = vec![3u8; 4000];
        let mut frags = fragment_frame(&payload, Kind::Video, 3, 512, 0.0, false).unwrap();
        frags.truncate(frags.len() - 2); // two missing indices, only one nacked per pass
        for frag in frags {
            ring.on_fragment(frag).unwrap();
        }
        std::thread::sleep(Duration::from_millis(2));
        let first = ring.poll_nacks(Instant::now());
        let nacked_first: Vec<u16> = first
            .iter()
            .filter_map(|a| match a {
                NackAction::Nack { indices, .. } => Some(indices.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(nacked_first.len(), 1, "only one index nacked per pass");

        // Immediately polling again must not re-nack within the backoff window.
        let second = ring.poll_nacks(Instant::now());
        let nacked_second: usize = second
            .iter()
            .filter_map(|a| match a {
                NackAction::Nack { indices, .. } => Some(indices.len()),
                _ => None,
            })
            .sum();
        assert_eq!(nacked_second, 0);
    }

    #[test]
    fn missing_fragments_escalate_to_iframe_request() {
        let mut ring = FrameRing::new(small_config());
        let payload = vec![9u8; 4000];
        let mut frags = fragment_frame(&payload, Kind::Video, 4, 512, 0.0, false).unwrap();
        frags.pop();
        for frag in frags {
            ring.on_fragment(frag).unwrap();
        }

        // max_missing_ticks = 2, so the third poll should escalate.
        let _ = ring.poll_nacks(Instant::now());
        let _ = ring.poll_nacks(Instant::now());
        let actions = ring.poll_nacks(Instant::now());
        assert!(actions.iter().any(|a| matches!(a, NackAction::IframeRequest)));
    }

    #[test]
    fn stale_slot_times_out_and_clears() {
        let mut ring = FrameRing::new(small_config());
        let payload = vec![2u8; 2000];
        let mut frags = fragment_frame(&payload, Kind::Video, 5, 512, 0.0, false).unwrap();
        frags.pop();
        for frag in frags {
            ring.on_fragment(frag).unwrap();
        }
        std::thread::sleep(Duration::from_millis(60));
        let actions = ring.poll_nacks(Instant::now());
        assert!(!actions.iter().any(|a| matches!(a, NackAction::Nack { .. })));
    }

    #[test]
    fn desync_beyond_threshold_requests_keyframe() {
        let mut ring = FrameRing::new(small_config());
        // Deliver a run of complete frames without ever marking them
        // rendered, so max_received_id races ahead of last_rendered_id.
        for id in 0..6 {
            let frags = fragment_frame(&[id as u8; 16], Kind::Video, id, 512, 0.0, false).unwrap();
            for frag in frags {
                ring.on_fragment(frag).unwrap();
            }
        }
        let actions = ring.poll_nacks(Instant::now());
        assert!(actions.iter().any(|a| matches!(a, NackAction::IframeRequest)));
        assert!(ring.waiting_for_keyframe());
    }

    #[test]
    fn keyframe_arrival_clears_waiting_flag() {
        let mut ring = FrameRing::new(small_config());
        for id in 0..6 {
            let frags = fragment_frame(&[id as u8; 16], Kind::Video, id, 512, 0.0, false).unwrap();
            for frag in frags {
                ring.on_fragment(frag).unwrap();
            }
        }
        let _ = ring.poll_nacks(Instant::now());
        assert!(ring.waiting_for_keyframe());
        ring.note_keyframe_received(10);
        assert!(!ring.waiting_for_keyframe());
    }
}
