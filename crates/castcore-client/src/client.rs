//! Owns the reassembly/decode/playout state for one connection: the
//! video and message frame rings, the congestion controller, and the
//! audio/video collaborators the two sync loops feed fragments into.

use std::time::Instant;

use tracing::{debug, warn};

use castcore_audio::{AudioPlayout, CpalSink};
use castcore_protocol::codec::decode_server_msg;
use castcore_protocol::congestion::{BitrateController, BitrateMessage};
use castcore_protocol::fragment::{fragment_frame, Fragment};
use castcore_protocol::ring::{ring_for_kind, FragmentOutcome, NackAction};
use castcore_protocol::{ClientMessage, CoreError, FrameId, FrameRing, Kind, ServerMessage, SessionId};
use castcore_video::{NoopSurface, VideoPipeline};

use crate::config::ClientConfig;

const DEFAULT_AUDIO_SAMPLE_RATE_HZ: u32 = 48_000;

/// One fully reassembled, decoded-or-dispatched delivery from either
/// transport, surfaced to the sync loops for anything they still need
/// to act on (everything media/decode-related is handled internally).
#[derive(Debug)]
pub enum Delivery {
    Server(ServerMessage),
    Quit,
}

pub struct ClientSession {
    pub session_id: SessionId,
    fragment_size: usize,

    video_ring: FrameRing,
    message_ring: FrameRing,
    next_outbound_message_id: FrameId,

    audio: AudioPlayout<CpalSink>,
    video: VideoPipeline<NoopSurface>,
    bitrate: BitrateController,
}

impl ClientSession {
    pub fn new(session_id: SessionId, config: &ClientConfig) -> Result<Self, CoreError> {
        let sink = CpalSink::open(config.output_device.as_deref(), DEFAULT_AUDIO_SAMPLE_RATE_HZ)?;
        let audio = AudioPlayout::new(sink)?;
        let video = VideoPipeline::new(NoopSurface::default(), config.output_width, config.output_height);

        Ok(Self {
            session_id,
            fragment_size: config.fragment_size.min(castcore_protocol::MAX_PAYLOAD),
            video_ring: ring_for_kind(Kind::Video, config.video_ring_config()),
            message_ring: ring_for_kind(Kind::Message, config.message_ring_config()),
            next_outbound_message_id: 0,
            audio,
            video,
            bitrate: BitrateController::new(config.initial_bitrate_kbps, Instant::now()),
        })
    }

    /// Splits an outbound `ClientMessage` into the fragment(s) to send
    /// over the unreliable channel (no FEC — control/input traffic is
    /// small enough to fit a single fragment and is resent on loss
    /// rather than repaired).
    pub fn fragment_outbound_message(&mut self, msg: &ClientMessage) -> Result<Vec<Fragment>, CoreError> {
        let payload = postcard::to_allocvec(msg)?;
        let frame_id = self.next_outbound_message_id;
        self.next_outbound_message_id = self.next_outbound_message_id.wrapping_add(1);
        fragment_frame(&payload, Kind::Message, frame_id, self.fragment_size, 0.0, false)
    }

    /// Feeds one fragment received over the unreliable channel into the
    /// right ring/collaborator. Audio and video frames are consumed
    /// internally (decoded and queued for playout/presentation);
    /// completed control messages come back out as a `Delivery`.
    pub fn on_unreliable_fragment(&mut self, frag: Fragment) -> Result<Option<Delivery>, CoreError> {
        match frag.kind {
            Kind::Audio => {
                self.audio.on_fragment(frag)?;
                Ok(None)
            }
            Kind::Video => match self.video_ring.on_fragment(frag)? {
                FragmentOutcome::FrameReady { frame_id, data } => {
                    self.video_ring.mark_rendered(frame_id);
                    match self.video.on_frame_bytes(&data) {
                        Ok(outcome) => debug!(frame_id, ?outcome, "video frame intake"),
                        Err(e) => warn!(frame_id, "malformed video frame: {e}"),
                    }
                    Ok(None)
                }
                _ => Ok(None),
            },
            Kind::Message => match self.message_ring.on_fragment(frag)? {
                FragmentOutcome::FrameReady { frame_id, data } => {
                    self.message_ring.mark_rendered(frame_id);
                    match decode_server_msg(&data)? {
                        ServerMessage::AudioFrequency { frequency } => {
                            self.audio.note_server_sample_rate(frequency)?;
                            Ok(None)
                        }
                        ServerMessage::Quit => Ok(Some(Delivery::Quit)),
                        other => Ok(Some(Delivery::Server(other))),
                    }
                }
                _ => Ok(None),
            },
            Kind::Gpu => {
                debug!("dropping Gpu-kind fragment: no consumer implemented");
                Ok(None)
            }
        }
    }

    /// Decodes one reliable-channel message payload (clipboard/file
    /// chunks and anything else routed over TCP).
    pub fn decode_reliable_message(&self, payload: &[u8]) -> Result<ServerMessage, CoreError> {
        decode_server_msg(payload)
    }

    pub fn encode_reliable_message(&self, msg: &ClientMessage) -> Result<Vec<u8>, CoreError> {
        Ok(postcard::to_allocvec(msg)?)
    }

    pub fn audio_tick(&mut self) -> Result<(), CoreError> {
        self.audio.tick()
    }

    pub fn present_video(&mut self) {
        self.video.present();
    }

    pub fn resize_video(&mut self, width: u32, height: u32, now: Instant) -> Option<(u32, u32)> {
        self.video.resize(width, height, now)
    }

    pub fn video_waiting_for_keyframe(&self) -> bool {
        self.video.waiting_for_keyframe()
    }

    pub fn request_video_keyframe_if_due(&mut self, now: Instant) -> bool {
        self.video.request_keyframe_if_due(now)
    }

    /// Polls the video and message rings' NACK engines (audio's ring is
    /// polled internally by `AudioPlayout::poll_nacks`, called by the
    /// caller alongside this). Every NACKed index feeds the congestion
    /// controller's sliding NACK-rate window (§4.5).
    pub fn poll_control_nacks(&mut self, now: Instant) -> Vec<(Kind, NackAction)> {
        let mut actions: Vec<(Kind, NackAction)> =
            self.video_ring.poll_nacks(now).into_iter().map(|a| (Kind::Video, a)).collect();
        actions.extend(self.message_ring.poll_nacks(now).into_iter().map(|a| (Kind::Message, a)));
        self.bitrate.record_nacks(now, actions.iter().map(|(_, a)| nacked_index_count(a)).sum());
        actions
    }

    pub fn poll_audio_nacks(&mut self, now: Instant) -> Vec<NackAction> {
        let actions = self.audio.poll_nacks(now);
        self.bitrate.record_nacks(now, actions.iter().map(nacked_index_count).sum());
        actions
    }

    /// Re-evaluates the congestion controller's sliding window, returning
    /// a recommendation at most once per `WINDOW` for the reliable loop
    /// to announce via `ClientMessage::Bitrate`.
    pub fn bitrate_tick(&mut self, now: Instant) -> Option<BitrateMessage> {
        self.bitrate.tick(now)
    }
}

fn nacked_index_count(action: &NackAction) -> usize {
    match action {
        NackAction::Nack { indices, .. } => indices.len(),
        NackAction::MissingFrame { .. } => 1,
        NackAction::IframeRequest | NackAction::StreamReset { .. } => 0,
    }
}

/// Builds the `ClientMessage` that carries one ring's `NackAction`,
/// favoring the bitarray form once more than one index is missing.
pub fn nack_action_to_message(kind: Kind, action: NackAction) -> ClientMessage {
    match action {
        NackAction::Nack { frame_id, indices } if indices.len() == 1 => {
            ClientMessage::Nack { kind_raw: kind as u32, frame_id, index: indices[0] }
        }
        NackAction::Nack { frame_id, indices } => {
            ClientMessage::NackBitarray { kind_raw: kind as u32, frame_id, bitarray: bitarray_from_indices(&indices) }
        }
        NackAction::MissingFrame { frame_id } => {
            ClientMessage::Nack { kind_raw: kind as u32, frame_id, index: 0 }
        }
        NackAction::IframeRequest => ClientMessage::IframeRequest,
        NackAction::StreamReset { .. } => ClientMessage::StreamResetRequest { kind_raw: kind as u32 },
    }
}

fn bitarray_from_indices(indices: &[u16]) -> Vec<u8> {
    let max = indices.iter().copied().max().unwrap_or(0) as usize;
    let mut bits = vec![0u8; max / 8 + 1];
    for &idx in indices {
        let idx = idx as usize;
        bits[idx / 8] |= 1 << (idx % 8);
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_action_single_index_uses_scalar_variant() {
        let action = NackAction::Nack { frame_id: 7, indices: vec![3] };
        let msg = nack_action_to_message(Kind::Video, action);
        assert!(matches!(msg, ClientMessage::Nack { frame_id: 7, index: 3, .. }));
    }

    #[test]
    fn nack_action_multi_index_uses_bitarray_variant() {
        let action = NackAction::Nack { frame_id: 7, indices: vec![1, 9] };
        let msg = nack_action_to_message(Kind::Video, action);
        match msg {
            ClientMessage::NackBitarray { bitarray, .. } => {
                assert_eq!(bitarray[0] & 0b10, 0b10);
                assert_eq!(bitarray[1] & 0b10, 0b10);
            }
            _ => panic!("expected bitarray variant"),
        }
    }

    #[test]
    fn missing_frame_maps_to_index_zero_nack() {
        let action = NackAction::MissingFrame { frame_id: 4 };
        let msg = nack_action_to_message(Kind::Audio, action);
        assert!(matches!(msg, ClientMessage::Nack { frame_id: 4, index: 0, .. }));
    }

    #[test]
    fn iframe_and_reset_map_directly() {
        assert!(matches!(nack_action_to_message(Kind::Video, NackAction::IframeRequest), ClientMessage::IframeRequest));
        let reset = NackAction::StreamReset { last_failed_id: 1 };
        assert!(matches!(
            nack_action_to_message(Kind::Video, reset),
            ClientMessage::StreamResetRequest { kind_raw } if kind_raw == Kind::Video as u32
        ));
    }

    #[test]
    fn fragment_outbound_message_roundtrips() {
        // Constructing a full `ClientSession` needs a real audio device, so
        // this exercises the pure fragment/encode path it wraps instead.
        let config = ClientConfig::default();
        let msg = ClientMessage::UdpPing { id: 9 };
        let payload = postcard::to_allocvec(&msg).unwrap();
        let fragments = fragment_frame(&payload, Kind::Message, 0, config.fragment_size, 0.0, false).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].kind, Kind::Message);
    }
}
