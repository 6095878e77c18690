use bytes::{Buf, BytesMut};

use crate::error::CoreError;
use crate::messages::{ClientMessage, ServerMessage};

/// Maximum size of one reliable control-plane message.
pub const MAX_MSG_SIZE: u32 = 65_536;

/// Current protocol version, advertised during the discovery handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Application version, read from Cargo.toml at compile time.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Encode a `ClientMessage` into a length-prefixed byte buffer for TCP transmission.
pub fn encode_client_msg(msg: &ClientMessage) -> Result<Vec<u8>, CoreError> {
    let payload = postcard::to_allocvec(msg)?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a `ClientMessage` from a postcard-encoded payload (without length prefix).
pub fn decode_client_msg(payload: &[u8]) -> Result<ClientMessage, CoreError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Encode a `ServerMessage` into a length-prefixed byte buffer for TCP transmission.
pub fn encode_server_msg(msg: &ServerMessage) -> Result<Vec<u8>, CoreError> {
    let payload = postcard::to_allocvec(msg)?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a `ServerMessage` from a postcard-encoded payload (without length prefix).
pub fn decode_server_msg(payload: &[u8]) -> Result<ServerMessage, CoreError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Attempt to extract one complete length-prefixed frame from a byte buffer.
///
/// Returns `Ok(Some(payload))` if a complete message is available,
/// `Ok(None)` if more data is needed, or `Err` if the message is too large.
///
/// Advances the buffer past the consumed frame.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, CoreError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_MSG_SIZE as usize {
        return Err(CoreError::MessageTooLarge(length, MAX_MSG_SIZE as usize));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    let payload = buf.split_to(length).to_vec();
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_client_message() {
        let msg = ClientMessage::Dimensions {
            width: 1920,
            height: 1080,
            dpi: 96,
        };
        let encoded = encode_client_msg(&msg).unwrap();
        let decoded = decode_client_msg(&encoded[4..]).unwrap();
        match decoded {
            ClientMessage::Dimensions { width, height, dpi } => {
                assert_eq!(width, 1920);
                assert_eq!(height, 1080);
                assert_eq!(dpi, 96);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_server_message() {
        let msg = ServerMessage::AudioFrequency { frequency: 48_000 };
        let encoded = encode_server_msg(&msg).unwrap();
        let decoded = decode_server_msg(&encoded[4..]).unwrap();
        match decoded {
            ServerMessage::AudioFrequency { frequency } => assert_eq!(frequency, 48_000),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn frame_decoding() {
        let msg = ClientMessage::TcpPing { id: 12345 };
        let encoded = encode_client_msg(&msg).unwrap();

        let mut buf = BytesMut::new();

        // Partial data — should return None
        buf.extend_from_slice(&encoded[..3]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());

        // Complete data
        buf.extend_from_slice(&encoded[3..]);
        let payload = try_decode_frame(&mut buf).unwrap().unwrap();
        let decoded = decode_client_msg(&payload).unwrap();
        match decoded {
            ClientMessage::TcpPing { id } => assert_eq!(id, 12345),
            _ => panic!("wrong variant"),
        }

        // Buffer should be empty now
        assert!(buf.is_empty());
    }

    #[test]
    fn roundtrip_quit() {
        let msg = ClientMessage::Quit;
        let encoded = encode_client_msg(&msg).unwrap();
        let decoded = decode_client_msg(&encoded[4..]).unwrap();
        assert!(matches!(decoded, ClientMessage::Quit));
    }

    #[test]
    fn roundtrip_stream_reset_request() {
        let msg = ClientMessage::StreamResetRequest { kind_raw: 1 };
        let encoded = encode_client_msg(&msg).unwrap();
        let decoded = decode_client_msg(&encoded[4..]).unwrap();
        match decoded {
            ClientMessage::StreamResetRequest { kind_raw } => assert_eq!(kind_raw, 1),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn roundtrip_file_transfer_messages() {
        let msg = ServerMessage::FileMetadata {
            transfer_id: 1,
            name: "report.pdf".into(),
            size: 4096,
        };
        let encoded = encode_server_msg(&msg).unwrap();
        let decoded = decode_server_msg(&encoded[4..]).unwrap();
        match decoded {
            ServerMessage::FileMetadata { transfer_id, name, size } => {
                assert_eq!(transfer_id, 1);
                assert_eq!(name, "report.pdf");
                assert_eq!(size, 4096);
            }
            _ => panic!("wrong variant"),
        }

        let msg = ServerMessage::FileGroupEnd { transfer_id: 1 };
        let encoded = encode_server_msg(&msg).unwrap();
        let decoded = decode_server_msg(&encoded[4..]).unwrap();
        assert!(matches!(decoded, ServerMessage::FileGroupEnd { transfer_id: 1 }));
    }

    #[test]
    fn frame_message_too_large() {
        let mut buf = BytesMut::new();
        let bad_len = (MAX_MSG_SIZE + 1).to_be_bytes();
        buf.extend_from_slice(&bad_len);
        buf.extend_from_slice(&[0u8; 100]);
        let result = try_decode_frame(&mut buf);
        assert!(matches!(result, Err(CoreError::MessageTooLarge(_, _))));
    }

    #[test]
    fn frame_partial_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]); // only 2 bytes, need 4
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_multiple_messages() {
        let msg1 = ClientMessage::UdpPing { id: 1 };
        let msg2 = ClientMessage::UdpPing { id: 2 };
        let enc1 = encode_client_msg(&msg1).unwrap();
        let enc2 = encode_client_msg(&msg2).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&enc1);
        buf.extend_from_slice(&enc2);

        let payload1 = try_decode_frame(&mut buf).unwrap().unwrap();
        let payload2 = try_decode_frame(&mut buf).unwrap().unwrap();
        match decode_client_msg(&payload1).unwrap() {
            ClientMessage::UdpPing { id } => assert_eq!(id, 1),
            _ => panic!("wrong variant"),
        }
        match decode_client_msg(&payload2).unwrap() {
            ClientMessage::UdpPing { id } => assert_eq!(id, 2),
            _ => panic!("wrong variant"),
        }
        assert!(buf.is_empty());
    }
}
