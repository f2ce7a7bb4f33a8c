//! clinvault-crypto: envelope codec for data at rest
//!
//! Key handling:
//! ```text
//! PIN (4-6 digits) + per-installation random salt (128-bit)
//!   └── PBKDF2-HMAC-SHA256 (>= 600k iterations) → 256-bit key
//!         └── AES-256-GCM (96-bit random IV per call, 128-bit tag)
//! ```
//!
//! Every encrypted blob is a self-describing JSON envelope:
//! `{"v":1,"salt":"<b64>","iv":"<b64>","ct":"<b64>"}`. The salt travels with
//! the ciphertext so the key can be re-derived from the PIN later.

pub mod envelope;
pub mod error;
pub mod kdf;
pub mod key;

pub use envelope::{decrypt, encrypt, is_envelope, Envelope, Payload, ENVELOPE_VERSION};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_key, generate_salt, DerivedKey, KdfParams};
pub use key::{decrypt_with, encrypt_with, KeyProvider, SessionKey};

/// Size of a derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the per-installation KDF salt (128-bit)
pub const SALT_SIZE: usize = 16;

/// Size of an AES-GCM IV (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of the GCM authentication tag
pub const TAG_SIZE: usize = 16;

pub(crate) fn b64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

pub(crate) fn b64_decode(s: &str) -> CryptoResult<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(s)
        .map_err(|e| CryptoError::Encoding(format!("base64 decode: {e}")))
}
