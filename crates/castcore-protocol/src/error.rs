use thiserror::Error;

/// The transport/reassembly core's single error taxonomy.
///
/// Propagation policy: `AuthFailed`/`MalformedPacket`/`StaleDuplicate` are
/// handled locally by the caller (drop + count, see `tracing` calls at the
/// call site) and never unwind a session; `ResourceExhausted`/`DecodeError`
/// trigger a stream reset or key-frame request but otherwise stay local;
/// `TransportLost`/`HandshakeFailed`/`UserQuit` unwind the current session
/// back to the supervising loop; `Fatal` indicates an invariant violation
/// and should only ever surface from a `debug_assert!`-guarded path.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("HMAC verification failed")]
    AuthFailed,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("stale or duplicate fragment")]
    StaleDuplicate,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("user quit")]
    UserQuit,

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_too_short_display() {
        let e = CoreError::PacketTooShort { expected: 17, got: 5 };
        let msg = e.to_string();
        assert!(msg.contains("17"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn message_too_large_display() {
        let e = CoreError::MessageTooLarge(100_000, 65_536);
        let msg = e.to_string();
        assert!(msg.contains("100000"));
        assert!(msg.contains("65536"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let core_err: CoreError = io_err.into();
        assert!(core_err.to_string().contains("broken"));
    }

    #[test]
    fn auth_failed_is_silent_drop_kind() {
        let e = CoreError::AuthFailed;
        assert_eq!(e.to_string(), "HMAC verification failed");
    }
}
