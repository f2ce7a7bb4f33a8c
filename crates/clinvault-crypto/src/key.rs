//! Unlocked key context and the provider seam used by persistence

use std::sync::Arc;

use crate::envelope::{self, Envelope};
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::DerivedKey;
use crate::SALT_SIZE;

/// A derived key together with the salt that produced it.
///
/// The salt is carried into every envelope so the key can be re-derived
/// from the PIN in a later session.
#[derive(Clone, Debug)]
pub struct SessionKey {
    key: DerivedKey,
    salt: [u8; SALT_SIZE],
}

impl SessionKey {
    pub fn new(key: DerivedKey, salt: [u8; SALT_SIZE]) -> Self {
        Self { key, salt }
    }

    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    pub fn salt_b64(&self) -> String {
        crate::b64_encode(&self.salt)
    }
}

/// Anything that may hold the currently unlocked key.
///
/// The persistence layer depends on this trait, never on the PIN machinery,
/// so it can be exercised with a fixed key (or none) in tests.
pub trait KeyProvider: Send + Sync {
    /// The unlocked key, or `None` while locked.
    fn current_key(&self) -> Option<SessionKey>;

    fn is_unlocked(&self) -> bool {
        self.current_key().is_some()
    }
}

impl KeyProvider for Option<SessionKey> {
    fn current_key(&self) -> Option<SessionKey> {
        self.clone()
    }
}

impl<T: KeyProvider + ?Sized> KeyProvider for Arc<T> {
    fn current_key(&self) -> Option<SessionKey> {
        (**self).current_key()
    }
}

/// Encrypt with whatever key the provider holds; `NotUnlocked` if none.
pub fn encrypt_with(provider: &dyn KeyProvider, plaintext: &str) -> CryptoResult<Envelope> {
    let key = provider.current_key().ok_or(CryptoError::NotUnlocked)?;
    envelope::encrypt(plaintext, &key)
}

/// Decrypt with whatever key the provider holds.
///
/// Non-envelope input passes through even while locked; an envelope while
/// locked is `NotUnlocked`.
pub fn decrypt_with(provider: &dyn KeyProvider, input: &str) -> CryptoResult<String> {
    match envelope::Payload::classify(input) {
        envelope::Payload::Plain(text) => Ok(text.to_string()),
        envelope::Payload::Envelope(env) => {
            let key = provider.current_key().ok_or(CryptoError::NotUnlocked)?;
            envelope::open(&env, &key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;

    fn test_key() -> SessionKey {
        SessionKey::new(DerivedKey::from_bytes([42u8; KEY_SIZE]), [3u8; SALT_SIZE])
    }

    #[test]
    fn test_encrypt_with_locked_provider_fails() {
        let locked: Option<SessionKey> = None;
        assert_eq!(
            encrypt_with(&locked, "secret").unwrap_err(),
            CryptoError::NotUnlocked
        );
    }

    #[test]
    fn test_provider_roundtrip() {
        let unlocked = Some(test_key());
        let env = encrypt_with(&unlocked, "sleep latency 45 min").unwrap();
        let back = decrypt_with(&unlocked, &env.to_json()).unwrap();
        assert_eq!(back, "sleep latency 45 min");
    }

    #[test]
    fn test_decrypt_with_locked_passthrough_and_refusal() {
        let locked: Option<SessionKey> = None;
        assert_eq!(decrypt_with(&locked, "{\"a\":1}").unwrap(), "{\"a\":1}");

        let env = encrypt_with(&Some(test_key()), "x").unwrap();
        assert_eq!(
            decrypt_with(&locked, &env.to_json()).unwrap_err(),
            CryptoError::NotUnlocked
        );
    }

    #[test]
    fn test_arc_provider_delegates() {
        let provider: Arc<dyn KeyProvider> = Arc::new(Some(test_key()));
        assert!(provider.is_unlocked());
        assert_eq!(provider.current_key().unwrap().salt(), &[3u8; SALT_SIZE]);
    }
}
