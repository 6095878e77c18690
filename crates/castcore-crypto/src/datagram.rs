//! Per-datagram authenticated encryption.
//!
//! Wire layout (all multi-byte fields little-endian):
//!
//! ```text
//! offset 0   auth_tag[16]            HMAC-SHA256(key, cipher_len || iv || ciphertext), truncated
//! offset 16  cipher_len: u32
//! offset 20  iv[16]
//! offset 36  ciphertext[cipher_len]  AES-128-CBC(plaintext)
//! ```
//!
//! `encrypt` always draws a fresh random IV; `decrypt` verifies the HMAC
//! before touching the cipher block chain ("verify before decrypt").

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use castcore_protocol::CoreError;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

const TAG_OFFSET: usize = 0;
const CIPHER_LEN_OFFSET: usize = TAG_LEN;
const IV_OFFSET: usize = CIPHER_LEN_OFFSET + 4;
const CIPHERTEXT_OFFSET: usize = IV_OFFSET + IV_LEN;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Number of ciphertext bytes PKCS7-padded AES-CBC produces for a
/// `plaintext_len`-byte message.
pub fn aes_cbc_ciphertext_len(plaintext_len: usize) -> usize {
    (plaintext_len / 16 + 1) * 16
}

fn hmac_tag(key: &[u8; KEY_LEN], cipher_len: u32, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&cipher_len.to_le_bytes());
    mac.update(iv);
    mac.update(ciphertext);
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

/// Encrypt `plaintext` into a self-contained wire datagram.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes128CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let cipher_len = ciphertext.len() as u32;
    let tag = hmac_tag(key, cipher_len, &iv, &ciphertext);

    let mut datagram = Vec::with_capacity(CIPHERTEXT_OFFSET + ciphertext.len());
    datagram.extend_from_slice(&tag);
    datagram.extend_from_slice(&cipher_len.to_le_bytes());
    datagram.extend_from_slice(&iv);
    datagram.extend_from_slice(&ciphertext);
    datagram
}

/// Verify and decrypt a wire datagram. HMAC is checked before any AES
/// decryption is attempted.
pub fn decrypt(datagram: &[u8], key: &[u8; KEY_LEN]) -> Result<Vec<u8>, CoreError> {
    if datagram.len() < CIPHERTEXT_OFFSET {
        return Err(CoreError::PacketTooShort {
            expected: CIPHERTEXT_OFFSET,
            got: datagram.len(),
        });
    }

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&datagram[TAG_OFFSET..TAG_OFFSET + TAG_LEN]);

    let cipher_len = u32::from_le_bytes(
        datagram[CIPHER_LEN_OFFSET..CIPHER_LEN_OFFSET + 4]
            .try_into()
            .unwrap(),
    );

    // Validate the declared ciphertext length exactly matches what follows
    // before computing the HMAC over it, to avoid over-reading past the
    // datagram bounds.
    if CIPHERTEXT_OFFSET + cipher_len as usize != datagram.len() {
        return Err(CoreError::MalformedPacket(format!(
            "cipher_len {cipher_len} does not match datagram length {}",
            datagram.len()
        )));
    }
    if cipher_len == 0 || cipher_len % 16 != 0 {
        return Err(CoreError::MalformedPacket(format!(
            "cipher_len {cipher_len} is not a positive multiple of the AES block size"
        )));
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&datagram[IV_OFFSET..IV_OFFSET + IV_LEN]);
    let ciphertext = &datagram[CIPHERTEXT_OFFSET..];

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&cipher_len.to_le_bytes());
    mac.update(&iv);
    mac.update(ciphertext);
    if mac.verify_slice(&tag).is_err() {
        tracing::warn!("datagram HMAC verification failed, dropping");
        return Err(CoreError::AuthFailed);
    }

    let mut buf = ciphertext.to_vec();
    let plaintext = Aes128CbcDec::new(key.into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| CoreError::MalformedPacket(format!("CBC padding invalid: {e}")))?;

    Ok(plaintext.to_vec())
}
