//! Video render pipeline: decode intake, render presentation, and control
//! (codec/dimension changes, cursor, key-frame timing) behind a render
//! mutex, matching the roles `castcore-audio::playout` plays for audio.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use castcore_protocol::CoreError;

use crate::decoder::{DecodedFrame, Decoder};

/// Throttle for outgoing `Dimensions` messages during a drag-resize.
pub const WINDOW_RESIZE_MESSAGE_INTERVAL: Duration = Duration::from_millis(200);
/// Minimum spacing between key-frame requests issued by this pipeline
/// (mirrors `RingBufferConfig::keyframe_request_interval`).
pub const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Hevc,
}

impl VideoCodec {
    fn to_u8(self) -> u8 {
        match self {
            VideoCodec::Hevc => 0,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(VideoCodec::Hevc),
            _ => None,
        }
    }
}

/// Fixed header the sender prepends to a reassembled `Kind::Video` frame's
/// bytes, ahead of the bitstream itself: the decode-intake metadata that
/// isn't otherwise recoverable from the bitstream without a full NAL-unit
/// parser (`is_keyframe`, `width`, `height`, `codec`).
pub const FRAME_HEADER_SIZE: usize = 1 + 4 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub is_keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub codec: VideoCodec,
}

impl FrameHeader {
    pub fn encode(&self, bitstream: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + bitstream.len());
        buf.push(self.is_keyframe as u8);
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.push(self.codec.to_u8());
        buf.extend_from_slice(bitstream);
        buf
    }

    /// Splits `buf` into `(header, bitstream)`.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), CoreError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(CoreError::PacketTooShort { expected: FRAME_HEADER_SIZE, got: buf.len() });
        }
        let is_keyframe = buf[0] != 0;
        let width = u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes"));
        let height = u32::from_le_bytes(buf[5..9].try_into().expect("4 bytes"));
        let codec = VideoCodec::from_u8(buf[9])
            .ok_or_else(|| CoreError::MalformedPacket(format!("unknown video codec tag {}", buf[9])))?;
        Ok((Self { is_keyframe, width, height, codec }, &buf[FRAME_HEADER_SIZE..]))
    }
}

/// A destination rectangle within the presentation surface, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Cursor appearance as carried by a completed video frame's metadata.
#[derive(Debug, Clone)]
pub enum CursorUpdate {
    SystemCursor(u32),
    Bitmap {
        width: u32,
        height: u32,
        rgba: Vec<u8>,
        hot_x: u32,
        hot_y: u32,
    },
}

/// Cursor state the control role hands to the surface: the new appearance
/// (if any changed this frame) plus whether relative mouse mode is active.
#[derive(Debug, Clone, Default)]
pub struct CursorState {
    pub update: Option<CursorUpdate>,
    pub relative_mouse: bool,
}

/// Texture upload + present, the one touch point with the window system.
/// Concrete window-system integration is out of scope for this crate; a
/// headless [`NoopSurface`] stands in for tests.
pub trait PresentationSurface: Send {
    fn upload_texture(&mut self, frame: &DecodedFrame);
    fn present(&mut self, dest: DestRect);
    fn update_cursor(&mut self, cursor: &CursorState);
}

/// A surface that records what it was asked to do, for use in tests that
/// exercise the pipeline without a real window.
#[derive(Debug, Default)]
pub struct NoopSurface {
    pub uploads: usize,
    pub presents: Vec<DestRect>,
    pub cursor_updates: usize,
}

impl PresentationSurface for NoopSurface {
    fn upload_texture(&mut self, _frame: &DecodedFrame) {
        self.uploads += 1;
    }
    fn present(&mut self, dest: DestRect) {
        self.presents.push(dest);
    }
    fn update_cursor(&mut self, _cursor: &CursorState) {
        self.cursor_updates += 1;
    }
}

/// Result of feeding one completed frame's bitstream to the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Decoded and queued for the next present.
    Rendered,
    /// Not a key frame and the decoder needs one (codec/dimensions changed,
    /// or none has ever been constructed); the frame was dropped.
    WaitingForKeyframe,
    /// The decoder failed to construct or decode; a key frame request is
    /// warranted.
    DecodeFailed,
}

/// State the render mutex guards: the pending texture and the render/resize
/// flags the control and UI-resize paths flip.
struct RenderMutexState {
    pending_texture: Option<DecodedFrame>,
    pending_render: bool,
    pending_resize_render: bool,
    output_width: u32,
    output_height: u32,
}

/// Owns decode intake, presentation, and control for one video stream.
pub struct VideoPipeline<S: PresentationSurface> {
    decoder: Option<Decoder>,
    server_width: u32,
    server_height: u32,
    server_codec: Option<VideoCodec>,
    shared: Mutex<RenderMutexState>,
    surface: S,
    last_keyframe_request: Option<Instant>,
    waiting_for_keyframe: bool,
    last_resize_sent: Option<Instant>,
    pending_dimensions: Option<(u32, u32)>,
}

impl<S: PresentationSurface> VideoPipeline<S> {
    pub fn new(surface: S, output_width: u32, output_height: u32) -> Self {
        Self {
            decoder: None,
            server_width: 0,
            server_height: 0,
            server_codec: None,
            shared: Mutex::new(RenderMutexState {
                pending_texture: None,
                pending_render: false,
                pending_resize_render: false,
                output_width,
                output_height,
            }),
            surface,
            last_keyframe_request: None,
            waiting_for_keyframe: true,
            last_resize_sent: None,
            pending_dimensions: None,
        }
    }

    pub fn waiting_for_keyframe(&self) -> bool {
        self.waiting_for_keyframe
    }

    /// Decode intake from the raw reassembled `Kind::Video` frame bytes
    /// (header-prefixed bitstream), as handed back by
    /// `FrameRing::on_fragment`.
    pub fn on_frame_bytes(&mut self, framed: &[u8]) -> Result<IntakeOutcome, CoreError> {
        let (header, bitstream) = FrameHeader::decode(framed)?;
        self.on_frame(bitstream, header.is_keyframe, header.width, header.height, header.codec)
    }

    /// Decode intake: feed one completed frame's bitstream to the decoder,
    /// tearing it down and reconstructing it if the frame announces a new
    /// `(width, height, codec)` and is itself a key frame.
    pub fn on_frame(
        &mut self,
        data: &[u8],
        is_keyframe: bool,
        width: u32,
        height: u32,
        codec: VideoCodec,
    ) -> Result<IntakeOutcome, CoreError> {
        let dimensions_changed =
            self.decoder.is_none() || width != self.server_width || height != self.server_height || Some(codec) != self.server_codec;

        if dimensions_changed {
            if !is_keyframe {
                debug!(width, height, "dimension/codec change awaits a key frame");
                return Ok(IntakeOutcome::WaitingForKeyframe);
            }
            match Decoder::new() {
                Ok(decoder) => {
                    self.decoder = Some(decoder);
                    self.server_width = width;
                    self.server_height = height;
                    self.server_codec = Some(codec);
                }
                Err(e) => {
                    warn!("video decoder construction failed: {e}");
                    return Ok(IntakeOutcome::DecodeFailed);
                }
            }
        }

        let decoder = self.decoder.as_mut().expect("decoder constructed above");
        let frames = match decoder.decode(data) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("video decode failed: {e}");
                return Ok(IntakeOutcome::DecodeFailed);
            }
        };

        if is_keyframe {
            self.waiting_for_keyframe = false;
        }

        if let Some(frame) = frames.into_iter().last() {
            let mut shared = self.shared.lock().expect("render mutex poisoned");
            shared.pending_texture = Some(frame);
            shared.pending_render = true;
        }

        Ok(IntakeOutcome::Rendered)
    }

    /// Render presentation: at render cadence, if a frame is pending,
    /// upload its texture and present it into the size-appropriate
    /// destination rectangle.
    pub fn present(&mut self) {
        let (frame, output_width, output_height) = {
            let mut shared = self.shared.lock().expect("render mutex poisoned");
            if !shared.pending_render {
                return;
            }
            shared.pending_render = false;
            let frame = shared.pending_texture.take();
            (frame, shared.output_width, shared.output_height)
        };
        let Some(frame) = frame else { return };

        let dest = dest_rect_for(frame.width, frame.height, output_width, output_height);
        self.surface.upload_texture(&frame);
        self.surface.present(dest);
    }

    /// Control: cursor descriptor attached to a completed frame.
    pub fn update_cursor(&mut self, cursor: CursorState) {
        self.surface.update_cursor(&cursor);
    }

    /// Control: a window-resize event from the UI side. Acquires the render
    /// mutex to suspend new-texture presentation, records the rounded
    /// dimensions, and returns the `(width, height)` to send as a
    /// `Dimensions` message if the throttle interval allows it (coalescing
    /// any pending resize otherwise).
    pub fn resize(&mut self, width: u32, height: u32, now: Instant) -> Option<(u32, u32)> {
        let rounded_width = (width / 8) * 8;
        let rounded_height = (height / 2) * 2;

        {
            let mut shared = self.shared.lock().expect("render mutex poisoned");
            shared.pending_resize_render = true;
            shared.output_width = rounded_width;
            shared.output_height = rounded_height;
            shared.pending_resize_render = false;
        }

        self.pending_dimensions = Some((rounded_width, rounded_height));

        let due = self
            .last_resize_sent
            .map(|t| now.duration_since(t) >= WINDOW_RESIZE_MESSAGE_INTERVAL)
            .unwrap_or(true);
        if due {
            self.last_resize_sent = Some(now);
            self.pending_dimensions.take()
        } else {
            None
        }
    }

    /// Control: key-frame request policy, additionally invoked whenever
    /// decoder construction fails.
    pub fn request_keyframe_if_due(&mut self, now: Instant) -> bool {
        let due = self
            .last_keyframe_request
            .map(|t| now.duration_since(t) >= KEYFRAME_REQUEST_INTERVAL)
            .unwrap_or(true);
        if due {
            self.last_keyframe_request = Some(now);
            self.waiting_for_keyframe = true;
        }
        due
    }
}

/// The destination rectangle is exactly the output dimensions when the
/// server's frame is within `{out_w..=out_w+8, out_h..=out_h+2}` (the
/// server rounds up to codec-required multiples); otherwise the full
/// decoded frame is rendered to minimize artifacts mid-resize.
fn dest_rect_for(frame_width: u32, frame_height: u32, output_width: u32, output_height: u32) -> DestRect {
    let width_close = frame_width >= output_width && frame_width <= output_width + 8;
    let height_close = frame_height >= output_height && frame_height <= output_height + 2;
    if width_close && height_close {
        DestRect { x: 0, y: 0, width: output_width, height: output_height }
    } else {
        DestRect { x: 0, y: 0, width: frame_width, height: frame_height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_frame(width: u32, height: u32) -> DecodedFrame {
        DecodedFrame {
            width,
            height,
            i420_data: vec![0u8; (width * height * 3 / 2) as usize],
        }
    }

    #[test]
    fn dest_rect_matches_output_when_close() {
        let dest = dest_rect_for(1288, 722, 1280, 720);
        assert_eq!(dest, DestRect { x: 0, y: 0, width: 1280, height: 720 });
    }

    #[test]
    fn dest_rect_falls_back_to_frame_size_when_far() {
        let dest = dest_rect_for(640, 480, 1280, 720);
        assert_eq!(dest, DestRect { x: 0, y: 0, width: 640, height: 480 });
    }

    #[test]
    fn resize_rounds_to_multiples_of_eight_and_two() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        let dims = pipeline.resize(1283, 721, Instant::now()).unwrap();
        assert_eq!(dims, (1280, 720));
    }

    #[test]
    fn resize_throttles_to_one_message_per_interval() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        let t0 = Instant::now();
        assert!(pipeline.resize(800, 600, t0).is_some());
        assert!(pipeline.resize(801, 600, t0 + Duration::from_millis(50)).is_none());
        assert!(pipeline
            .resize(802, 600, t0 + WINDOW_RESIZE_MESSAGE_INTERVAL + Duration::from_millis(1))
            .is_some());
    }

    #[test]
    fn keyframe_request_is_throttled() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        let t0 = Instant::now();
        assert!(pipeline.request_keyframe_if_due(t0));
        assert!(!pipeline.request_keyframe_if_due(t0 + Duration::from_millis(10)));
        assert!(pipeline.request_keyframe_if_due(t0 + KEYFRAME_REQUEST_INTERVAL + Duration::from_millis(1)));
    }

    #[test]
    fn non_keyframe_before_any_decoder_waits() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        let outcome = pipeline.on_frame(&[0u8; 16], false, 1280, 720, VideoCodec::Hevc).unwrap();
        assert_eq!(outcome, IntakeOutcome::WaitingForKeyframe);
    }

    #[test]
    fn present_is_a_noop_without_a_pending_frame() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        pipeline.present();
        assert_eq!(pipeline.surface.presents.len(), 0);
    }

    #[test]
    fn frame_header_roundtrips_around_bitstream() {
        let header = FrameHeader { is_keyframe: true, width: 1280, height: 720, codec: VideoCodec::Hevc };
        let bitstream = [1u8, 2, 3, 4, 5];
        let framed = header.encode(&bitstream);
        let (decoded, rest) = FrameHeader::decode(&framed).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(rest, bitstream);
    }

    #[test]
    fn frame_header_decode_rejects_short_buffer() {
        assert!(FrameHeader::decode(&[0u8; 3]).is_err());
    }

    #[test]
    fn on_frame_bytes_dispatches_through_header() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        let header = FrameHeader { is_keyframe: false, width: 1280, height: 720, codec: VideoCodec::Hevc };
        let framed = header.encode(&[0u8; 16]);
        let outcome = pipeline.on_frame_bytes(&framed).unwrap();
        assert_eq!(outcome, IntakeOutcome::WaitingForKeyframe);
    }

    #[test]
    fn manually_queued_frame_presents_into_dest_rect() {
        let mut pipeline = VideoPipeline::new(NoopSurface::default(), 1280, 720);
        {
            let mut shared = pipeline.shared.lock().unwrap();
            shared.pending_texture = Some(fake_frame(1280, 720));
            shared.pending_render = true;
        }
        pipeline.present();
        assert_eq!(pipeline.surface.uploads, 1);
        assert_eq!(pipeline.surface.presents.len(), 1);
    }
}
