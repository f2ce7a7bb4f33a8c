//! AES-256-GCM envelope encryption
//!
//! Envelope format (JSON):
//! ```text
//! {"v":1,"salt":"<b64 16 bytes>","iv":"<b64 12 bytes>","ct":"<b64 ciphertext||tag>"}
//! ```
//!
//! `decrypt` accepts anything: input that is not an envelope is legacy
//! plaintext (written before encryption existed) and is returned unchanged.
//! That decision is made up front by [`Payload::classify`], not by catching
//! a decryption error.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::key::SessionKey;
use crate::{b64_decode, b64_encode, IV_SIZE};

/// Current envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

/// Wire form of an encrypted blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version
    pub v: u32,
    /// KDF salt of the key that sealed this envelope (base64)
    pub salt: String,
    /// One-time IV (base64)
    pub iv: String,
    /// Ciphertext with appended GCM tag (base64)
    pub ct: String,
}

impl Envelope {
    /// Serialize to the compact JSON wire form.
    pub fn to_json(&self) -> String {
        // A struct of four plain fields always serializes
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode the salt field.
    pub fn salt_bytes(&self) -> CryptoResult<Vec<u8>> {
        b64_decode(&self.salt)
    }
}

/// Result of inspecting a stored payload before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    /// A JSON object carrying `v`, `salt`, `iv` and `ct`
    Envelope(Envelope),
    /// Anything else: legacy or unencrypted data
    Plain(&'a str),
}

impl<'a> Payload<'a> {
    pub fn classify(input: &'a str) -> Self {
        let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(input)
        else {
            return Payload::Plain(input);
        };

        let v = map.get("v").and_then(|v| v.as_u64());
        let field = |name: &str| map.get(name).and_then(|v| v.as_str()).map(str::to_string);

        match (v, field("salt"), field("iv"), field("ct")) {
            (Some(v), Some(salt), Some(iv), Some(ct)) => Payload::Envelope(Envelope {
                v: u32::try_from(v).unwrap_or(u32::MAX),
                salt,
                iv,
                ct,
            }),
            _ => Payload::Plain(input),
        }
    }
}

/// True if `input` has envelope shape (regardless of version).
pub fn is_envelope(input: &str) -> bool {
    matches!(Payload::classify(input), Payload::Envelope(_))
}

/// Encrypt a UTF-8 string under `key` with a fresh random IV.
pub fn encrypt(plaintext: &str, key: &SessionKey) -> CryptoResult<Envelope> {
    let cipher = Aes256Gcm::new_from_slice(key.key().as_bytes())
        .map_err(|e| CryptoError::Encoding(format!("AES key: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| CryptoError::Encoding(format!("AES-GCM seal: {e}")))?;

    Ok(Envelope {
        v: ENVELOPE_VERSION,
        salt: key.salt_b64(),
        iv: b64_encode(&iv),
        ct: b64_encode(&ct),
    })
}

/// Decrypt `input` under `key`, or pass it through if it is not an envelope.
pub fn decrypt(input: &str, key: &SessionKey) -> CryptoResult<String> {
    match Payload::classify(input) {
        Payload::Plain(text) => Ok(text.to_string()),
        Payload::Envelope(env) => open(&env, key),
    }
}

/// Open a parsed envelope. Every failure past the version check is
/// `DecryptionFailed`; garbage is never returned.
pub fn open(env: &Envelope, key: &SessionKey) -> CryptoResult<String> {
    if env.v != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(env.v));
    }

    let iv = b64_decode(&env.iv).map_err(|_| CryptoError::DecryptionFailed)?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let ct = b64_decode(&env.ct).map_err(|_| CryptoError::DecryptionFailed)?;

    let cipher = Aes256Gcm::new_from_slice(key.key().as_bytes())
        .map_err(|e| CryptoError::Encoding(format!("AES key: {e}")))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}
