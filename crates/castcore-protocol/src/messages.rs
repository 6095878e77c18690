//! The reliable control-plane message set, carried over
//! the TCP control connection framed by [`crate::codec`].

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reply to a client `TcpPing`/`UdpPing`, echoing its `id` for RTT math.
    Pong { id: u32 },

    /// Server-side audio device sample rate, needed before the client can
    /// size its playout buffer.
    AudioFrequency { frequency: u32 },

    /// One chunk of a (possibly multi-chunk) clipboard update, server to
    /// client direction (remote clipboard changed).
    ClipboardChunk {
        chunk_index: u32,
        num_chunks: u32,
        data: Vec<u8>,
    },

    /// Remote window title changed; update the local chrome.
    WindowTitle { title: String },

    /// Remote application asked to open a URI in the client's browser.
    OpenUri { uri: String },

    /// Remote window entered or left fullscreen.
    Fullscreen { is_fullscreen: bool },

    /// Metadata for an incoming file transfer server → client (e.g. a
    /// remote-initiated download). Followed by one or more `FileData`.
    FileMetadata {
        transfer_id: u32,
        name: String,
        size: u64,
    },

    /// One chunk of file payload for `transfer_id`.
    FileData {
        transfer_id: u32,
        chunk_index: u32,
        data: Vec<u8>,
    },

    /// Marks the final chunk of `transfer_id`; the client may close the file.
    FileGroupEnd { transfer_id: u32 },

    /// A user-facing notification the remote application raised.
    Notification { title: String, message: String },

    /// The server wants to push a file to the client and is asking it to
    /// prepare a destination (client answers with further `FileData` is
    /// not expected; this primes a client-side save dialog).
    InitiateUpload { name: String, size: u64 },

    /// The server is terminating the session.
    Quit,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// A single key press/release event.
    Keyboard { code: u32, pressed: bool },

    /// A mouse button press/release event.
    MouseButton { button: u8, pressed: bool },

    /// Scroll wheel delta.
    MouseWheel { delta_x: i32, delta_y: i32 },

    /// Absolute or relative pointer motion, depending on `relative`.
    MouseMotion { x: i32, y: i32, relative: bool },

    /// A trackpad/touch multi-finger gesture.
    Multigesture {
        dist: f32,
        theta: f32,
        num_fingers: u8,
    },

    /// Full modifier-key state snapshot, sent on focus regain to resync.
    KeyboardState { modifiers: u16, caps_lock: bool, num_lock: bool },

    /// The client's render surface changed size; server should reconfigure
    /// the encode pipeline.
    Dimensions { width: u32, height: u32, dpi: u32 },

    /// Ask the server to begin sending audio/video.
    StartStreaming,

    /// Ask the server to stop sending audio/video (pause, not teardown).
    StopStreaming,

    /// Client-measured available bandwidth, used by the server-side
    /// congestion controller.
    Bitrate { bitrate_kbps: u32, burst_bitrate_kbps: u32 },

    /// RTT probe carried over UDP.
    UdpPing { id: u32 },

    /// RTT probe carried over TCP (used while the UDP path is still being
    /// established).
    TcpPing { id: u32 },

    /// A single missing fragment, named by frame and index.
    Nack { kind_raw: u32, frame_id: i32, index: u16 },

    /// A batch of missing fragment indices for one frame, encoded as a
    /// bitarray to avoid one `Nack` per lost fragment during a burst loss.
    NackBitarray {
        kind_raw: u32,
        frame_id: i32,
        bitarray: Vec<u8>,
    },

    /// Ask the server to produce a key frame out of band (decoder could not
    /// recover from the fragments received).
    IframeRequest,

    /// Ask the server to reset the named reliable stream from scratch.
    StreamResetRequest { kind_raw: u32 },

    /// First message of the discovery handshake,
    /// carried over the rendezvous channel before a `SessionId` exists.
    DiscoveryRequest { client_nonce: [u8; 16] },

    /// Ask the server to open a URL in its context (reverse of `OpenUri`).
    OpenUrl { url: String },

    /// One chunk of a local clipboard update, client to server direction.
    ClipboardChunk {
        chunk_index: u32,
        num_chunks: u32,
        data: Vec<u8>,
    },

    /// Metadata for a file the client is uploading to the server.
    FileMetadata {
        transfer_id: u32,
        name: String,
        size: u64,
    },

    /// One chunk of file payload for `transfer_id`.
    FileData {
        transfer_id: u32,
        chunk_index: u32,
        data: Vec<u8>,
    },

    /// A file is being dragged over the remote window (for drop-target UI).
    FileDrag { x: i32, y: i32, present: bool },

    /// Cancel an in-flight upload.
    FileUploadCancel { transfer_id: u32 },

    /// Switch between absolute and relative pointer interaction.
    InteractionMode { relative: bool },

    /// The client is disconnecting gracefully.
    Quit,
}

/// Echoed by both peers once the discovery handshake completes, binding
/// subsequent UDP traffic to this control connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionBinding {
    pub session_id: SessionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_roundtrips_through_postcard() {
        let msg = ClientMessage::Bitrate {
            bitrate_kbps: 4000,
            burst_bitrate_kbps: 6000,
        };
        let bytes = postcard::to_allocvec(&msg).unwrap();
        let decoded: ClientMessage = postcard::from_bytes(&bytes).unwrap();
        match decoded {
            ClientMessage::Bitrate { bitrate_kbps, burst_bitrate_kbps } => {
                assert_eq!(bitrate_kbps, 4000);
                assert_eq!(burst_bitrate_kbps, 6000);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_message_roundtrips_through_postcard() {
        let msg = ServerMessage::WindowTitle { title: "remote desktop".into() };
        let bytes = postcard::to_allocvec(&msg).unwrap();
        let decoded: ServerMessage = postcard::from_bytes(&bytes).unwrap();
        match decoded {
            ServerMessage::WindowTitle { title } => assert_eq!(title, "remote desktop"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn nack_bitarray_carries_arbitrary_length() {
        let msg = ClientMessage::NackBitarray {
            kind_raw: 1,
            frame_id: 42,
            bitarray: vec![0xff, 0x0f, 0x00],
        };
        let bytes = postcard::to_allocvec(&msg).unwrap();
        let decoded: ClientMessage = postcard::from_bytes(&bytes).unwrap();
        match decoded {
            ClientMessage::NackBitarray { bitarray, .. } => assert_eq!(bitarray, vec![0xff, 0x0f, 0x00]),
            _ => panic!("wrong variant"),
        }
    }
}
