pub mod decoder;
pub mod convert;
pub mod presentation;

pub use presentation::{
    CursorState, CursorUpdate, DestRect, FrameHeader, IntakeOutcome, NoopSurface, PresentationSurface,
    VideoCodec, VideoPipeline, FRAME_HEADER_SIZE, KEYFRAME_REQUEST_INTERVAL, WINDOW_RESIZE_MESSAGE_INTERVAL,
};
