use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Encryption was requested before any key was loaded.
    #[error("no key loaded: unlock with the PIN first")]
    NotUnlocked,

    /// Well-formed envelope that does not open under the given key
    /// (wrong key, corrupted ciphertext, tag mismatch).
    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}
