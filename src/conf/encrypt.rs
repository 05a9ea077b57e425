//! Encrypted-configuration envelope
//!
//! A configuration file may be stored as base64-encoded NaCl-secretbox
//! ciphertext (XSalsa20-Poly1305). When `MEDIARELAY_CONFKEY` is set, the file
//! is decrypted before parsing. The wire layout is the classic secretbox one:
//! a 24-byte nonce followed by ciphertext+tag. The key is the UTF-8 bytes of
//! the variable, zero-padded to 32 bytes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};

use super::ConfError;

/// Name of the environment variable carrying the decryption key.
pub const CONFKEY_ENV: &str = "MEDIARELAY_CONFKEY";

const NONCE_LEN: usize = 24;

fn key_from_str(key: &str) -> Key {
    let mut k = [0u8; 32];
    let bytes = key.as_bytes();
    let n = bytes.len().min(32);
    k[..n].copy_from_slice(&bytes[..n]);
    Key::from(k)
}

/// Decrypts a base64 secretbox envelope produced by [`encrypt`].
pub fn decrypt(content: &[u8], key: &str) -> Result<Vec<u8>, ConfError> {
    let text: String = std::str::from_utf8(content)
        .map_err(|_| ConfError::Envelope("content is not valid base64".into()))?
        .split_whitespace()
        .collect();

    let raw = BASE64
        .decode(text)
        .map_err(|e| ConfError::Envelope(format!("invalid base64: {e}")))?;

    if raw.len() < NONCE_LEN {
        return Err(ConfError::Envelope("content is too short".into()));
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

    let cipher = XSalsa20Poly1305::new(&key_from_str(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ConfError::Envelope("decryption failed".into()))
}

/// Seals `plain` into a base64 secretbox envelope. The caller supplies the
/// nonce; it must be unique per key.
pub fn encrypt(plain: &[u8], key: &str, nonce: [u8; NONCE_LEN]) -> Result<String, ConfError> {
    let cipher = XSalsa20Poly1305::new(&key_from_str(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| ConfError::Envelope("encryption failed".into()))?;

    let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let plain = b"paths:\n  path1:\n  path2:\n";
        let key = "testing123testin";
        let nonce: [u8; NONCE_LEN] = rand::random();

        let sealed = encrypt(plain, key, nonce).unwrap();
        let opened = decrypt(sealed.as_bytes(), key).unwrap();
        assert_eq!(opened, plain);
    }

    #[test]
    fn test_wrong_key() {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let sealed = encrypt(b"logLevel: debug\n", "right-key", nonce).unwrap();
        assert!(decrypt(sealed.as_bytes(), "wrong-key").is_err());
    }

    #[test]
    fn test_garbage() {
        assert!(decrypt(b"@@@not-base64@@@", "key").is_err());
        assert!(decrypt(b"aGVsbG8=", "key").is_err()); // too short for a nonce
    }
}
