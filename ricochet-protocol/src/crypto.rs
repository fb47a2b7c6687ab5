//! Symmetric crypto envelope for frame bodies and credentials.
//!
//! Sealed layout, hex encoded:
//!
//! ```text
//! +-------------+-------------------------------------------------+
//! | aead nonce  | AEAD( plaintext || separator || marker ) + tag  |
//! +-------------+-------------------------------------------------+
//! ```
//!
//! The marker is the caller's per-message nonce, or
//! [`DEFAULT_NONCE_MARKER`](crate::DEFAULT_NONCE_MARKER). Opening a payload
//! under the wrong key fails the AEAD tag; a payload without the separator
//! is rejected as well.

use crate::config::CipherKind;
use crate::error::ProtocolError;
use chacha20poly1305::aead::generic_array::typenum::Unsigned;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Nonce};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encrypts and decrypts payloads under a shared private key.
#[derive(Debug, Clone)]
pub struct Envelope {
    cipher: CipherKind,
    separator: String,
}

impl Envelope {
    pub fn new(cipher: CipherKind, separator: &str) -> Self {
        Self {
            cipher,
            separator: separator.to_string(),
        }
    }

    /// Seals `plaintext` under `key`, returning hex ciphertext.
    pub fn encrypt(
        &self,
        key: &str,
        plaintext: &str,
        nonce: Option<&str>,
    ) -> Result<String, ProtocolError> {
        let marker = nonce.unwrap_or(crate::DEFAULT_NONCE_MARKER);
        let mut data = String::with_capacity(plaintext.len() + self.separator.len() + marker.len());
        data.push_str(plaintext);
        data.push_str(&self.separator);
        data.push_str(marker);

        let key = derive_key(key);
        let sealed = match self.cipher {
            CipherKind::ChaCha20Poly1305 => seal::<ChaCha20Poly1305>(&key, data.as_bytes())?,
            CipherKind::XChaCha20Poly1305 => seal::<XChaCha20Poly1305>(&key, data.as_bytes())?,
        };
        Ok(hex::encode(sealed))
    }

    /// Opens hex ciphertext under `key`, returning the plaintext before the
    /// separator.
    pub fn decrypt(&self, key: &str, ciphertext: &str) -> Result<String, ProtocolError> {
        let raw = hex::decode(ciphertext.trim()).map_err(|_| ProtocolError::Decrypt("not hex"))?;

        let key = derive_key(key);
        let opened = match self.cipher {
            CipherKind::ChaCha20Poly1305 => open::<ChaCha20Poly1305>(&key, &raw)?,
            CipherKind::XChaCha20Poly1305 => open::<XChaCha20Poly1305>(&key, &raw)?,
        };
        let text = String::from_utf8(opened).map_err(|_| ProtocolError::Decrypt("not UTF-8"))?;

        match text.find(&self.separator) {
            Some(pos) => Ok(text[..pos].to_string()),
            None => Err(ProtocolError::Decrypt("separator missing")),
        }
    }

    /// Serializes and seals a frame body.
    pub fn encrypt_json(
        &self,
        key: &str,
        body: &Value,
        nonce: Option<&str>,
    ) -> Result<Value, ProtocolError> {
        let plaintext = serde_json::to_string(body)?;
        Ok(Value::String(self.encrypt(key, &plaintext, nonce)?))
    }

    /// Opens a sealed frame body and parses the JSON inside it.
    pub fn decrypt_json(&self, key: &str, body: &Value) -> Result<Value, ProtocolError> {
        let ciphertext = body
            .as_str()
            .ok_or(ProtocolError::Decrypt("body is not a string"))?;
        let plaintext = self.decrypt(key, ciphertext)?;
        serde_json::from_str(&plaintext).map_err(|_| ProtocolError::Decrypt("plaintext is not JSON"))
    }
}

fn derive_key(key: &str) -> [u8; 32] {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn seal<C: Aead + KeyInit>(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let cipher = C::new(GenericArray::from_slice(key));
    let mut nonce = Nonce::<C>::default();
    OsRng.fill_bytes(nonce.as_mut_slice());

    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| ProtocolError::Encrypt)?;

    let mut out = Vec::with_capacity(nonce.len() + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open<C: Aead + KeyInit>(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let nonce_len = <C as AeadCore>::NonceSize::USIZE;
    if data.len() < nonce_len {
        return Err(ProtocolError::Decrypt("truncated"));
    }
    let (nonce, sealed) = data.split_at(nonce_len);

    let cipher = C::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), sealed)
        .map_err(|_| ProtocolError::Decrypt("authentication failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(CipherKind::default(), crate::DEFAULT_ENCRYPTION_SEPARATOR)
    }

    #[test]
    fn test_roundtrip() {
        let env = envelope();
        let sealed = env.encrypt("secret", "hello world", None).unwrap();
        assert_eq!(env.decrypt("secret", &sealed).unwrap(), "hello world");
    }

    #[test]
    fn test_roundtrip_with_nonce() {
        let env = envelope();
        let sealed = env.encrypt("secret", "payload", Some("msg-42")).unwrap();
        assert_eq!(env.decrypt("secret", &sealed).unwrap(), "payload");
    }

    #[test]
    fn test_ciphertext_is_hex_and_randomized() {
        let env = envelope();
        let a = env.encrypt("secret", "same", None).unwrap();
        let b = env.encrypt("secret", "same", None).unwrap();
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let env = envelope();
        let sealed = env.encrypt("key-one", "hello", None).unwrap();
        let result = env.decrypt("key-two", &sealed);
        assert!(matches!(result, Err(ProtocolError::Decrypt(_))));
    }

    #[test]
    fn test_corrupted_payload_fails() {
        let env = envelope();
        let mut sealed = env.encrypt("secret", "hello", None).unwrap();
        let last = if sealed.ends_with('0') { '1' } else { '0' };
        sealed.pop();
        sealed.push(last);
        assert!(env.decrypt("secret", &sealed).is_err());
        assert!(env.decrypt("secret", "zz-not-hex").is_err());
        assert!(env.decrypt("secret", "abcd").is_err());
    }

    #[test]
    fn test_missing_separator_fails() {
        let sealer = Envelope::new(CipherKind::default(), "::other::");
        let sealed = sealer.encrypt("secret", "hello", None).unwrap();
        let result = envelope().decrypt("secret", &sealed);
        assert!(matches!(
            result,
            Err(ProtocolError::Decrypt("separator missing"))
        ));
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let env = Envelope::new(
            CipherKind::XChaCha20Poly1305,
            crate::DEFAULT_ENCRYPTION_SEPARATOR,
        );
        let sealed = env.encrypt("secret", "extended nonce", None).unwrap();
        assert_eq!(env.decrypt("secret", &sealed).unwrap(), "extended nonce");
        assert!(envelope().decrypt("secret", &sealed).is_err());
    }

    #[test]
    fn test_json_body_roundtrip() {
        let env = envelope();
        let body = json!({"n": 1, "tags": ["a", "b"]});
        let sealed = env.encrypt_json("secret", &body, Some("id-1")).unwrap();
        assert!(sealed.is_string());
        assert_eq!(env.decrypt_json("secret", &sealed).unwrap(), body);
        assert!(env.decrypt_json("secret", &json!({"n": 1})).is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(key in ".{1,32}", text in "[^\u{1f}]{0,256}") {
            let env = envelope();
            let sealed = env.encrypt(&key, &text, None).unwrap();
            prop_assert_eq!(env.decrypt(&key, &sealed).unwrap(), text);
        }

        #[test]
        fn prop_wrong_key_never_opens(text in "[a-z]{0,64}", suffix in "[a-z]{1,8}") {
            let env = envelope();
            let sealed = env.encrypt("base-key", &text, None).unwrap();
            let other = format!("base-key{}", suffix);
            prop_assert!(env.decrypt(&other, &sealed).is_err());
        }
    }
}
