//! Pre-shared key parsing.
//!
//! The key is generated out of band and handed to both peers as a 32-hex-
//! character string; it must decode to exactly 16 bytes or the CLI layer
//! exits with `EXIT_CLI`. Held in a `Zeroizing` buffer so it doesn't linger
//! in memory past the session's lifetime.

use zeroize::Zeroizing;

use castcore_protocol::CoreError;

pub const KEY_LEN: usize = 16;

/// Decode a hex-encoded pre-shared key. Rejects anything that doesn't
/// decode to exactly `KEY_LEN` bytes.
pub fn parse_preshared_key(hex: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, CoreError> {
    let trimmed = hex.trim();
    if trimmed.len() != KEY_LEN * 2 {
        return Err(CoreError::MalformedPacket(format!(
            "private key must be exactly {} hex characters, got {}",
            KEY_LEN * 2,
            trimmed.len()
        )));
    }

    let mut key = [0u8; KEY_LEN];
    for (i, byte) in key.iter_mut().enumerate() {
        let s = &trimmed[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(s, 16)
            .map_err(|_| CoreError::MalformedPacket(format!("invalid hex byte '{s}' in private key")))?;
    }

    Ok(Zeroizing::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_hex_key() {
        let key = parse_preshared_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(*key, [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ]);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_preshared_key("0011").is_err());
        assert!(parse_preshared_key(&"00".repeat(17)).is_err());
    }

    #[test]
    fn rejects_non_hex_characters() {
        assert!(parse_preshared_key(&"zz".repeat(16)).is_err());
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let key = parse_preshared_key("  000102030405060708090a0b0c0d0e0f  \n").unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0x0f);
    }
}
