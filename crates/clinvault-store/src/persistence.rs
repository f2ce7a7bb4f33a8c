//! Persistence adapter: the document slot in the durable region, sealed
//! through the envelope codec whenever a key is available.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use clinvault_crypto::{decrypt_with, envelope, CryptoError, KeyProvider, SessionKey};
use clinvault_storage::{slots, Region, SlotError};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] SlotError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("no key loaded and plaintext storage is disabled")]
    Locked,
}

/// What `load` found in the document slot.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Nothing stored yet
    Empty,
    Document(Value),
    /// Something is stored but cannot be turned into a document
    Unreadable(String),
}

pub struct Persistence {
    region: Region,
    keys: Arc<dyn KeyProvider>,
    allow_plaintext: bool,
}

impl Persistence {
    pub fn new(region: Region, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            region,
            keys,
            allow_plaintext: true,
        }
    }

    /// When false, `save` refuses to write unencrypted data.
    pub fn with_allow_plaintext(mut self, allow: bool) -> Self {
        self.allow_plaintext = allow;
        self
    }

    pub fn is_encrypting(&self) -> bool {
        self.keys.is_unlocked()
    }

    /// Serialize and write the document, sealed if a key is loaded.
    pub async fn save(&self, doc: &Value) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(doc)?;
        let payload = match self.keys.current_key() {
            Some(key) => envelope::encrypt(&json, &key)?.to_json(),
            None if self.allow_plaintext => {
                tracing::warn!("no key loaded; saving session document unencrypted");
                json
            }
            None => return Err(PersistenceError::Locked),
        };
        self.write(&payload).await
    }

    /// Seal the document under `key` regardless of what the provider holds.
    /// Used to re-seal under a key that is not live yet.
    pub async fn save_with(&self, doc: &Value, key: &SessionKey) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(doc)?;
        let payload = envelope::encrypt(&json, key)?.to_json();
        self.write(&payload).await
    }

    async fn write(&self, payload: &str) -> Result<(), PersistenceError> {
        self.region
            .write(slots::SESSION_DOCUMENT, payload)
            .await?;
        tracing::debug!(bytes = payload.len(), "session document saved");
        Ok(())
    }

    /// Read the document slot. Only I/O failures are errors; anything stored
    /// that cannot be decrypted or parsed is `Unreadable`.
    pub async fn load(&self) -> Result<LoadOutcome, PersistenceError> {
        let Some(raw) = self.region.read(slots::SESSION_DOCUMENT).await? else {
            return Ok(LoadOutcome::Empty);
        };

        let text = match decrypt_with(&*self.keys, &raw) {
            Ok(text) => text,
            Err(e) => return Ok(LoadOutcome::Unreadable(e.to_string())),
        };

        Ok(match serde_json::from_str::<Value>(&text) {
            Ok(doc @ Value::Object(_)) => LoadOutcome::Document(doc),
            Ok(_) => LoadOutcome::Unreadable("stored session is not a JSON object".into()),
            Err(e) => LoadOutcome::Unreadable(format!("stored session is not valid JSON: {e}")),
        })
    }

    /// Raw slot contents, exactly as stored.
    pub async fn raw(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.region.read(slots::SESSION_DOCUMENT).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinvault_crypto::{is_envelope, DerivedKey, SessionKey};
    use serde_json::json;

    fn key(byte: u8) -> Option<SessionKey> {
        Some(SessionKey::new(DerivedKey::from_bytes([byte; 32]), [byte; 16]))
    }

    fn adapter(region: &Region, keys: Option<SessionKey>) -> Persistence {
        Persistence::new(region.clone(), Arc::new(keys))
    }

    #[tokio::test]
    async fn test_save_load_encrypted() {
        let region = Region::in_memory("durable").unwrap();
        let p = adapter(&region, key(1));
        assert!(p.is_encrypting());
        let doc = json!({"patient": {"name": "A"}});

        p.save(&doc).await.unwrap();
        let raw = p.raw().await.unwrap().unwrap();
        assert!(is_envelope(&raw));
        assert!(!raw.contains("patient"));

        assert_eq!(p.load().await.unwrap(), LoadOutcome::Document(doc));
    }

    #[tokio::test]
    async fn test_save_plaintext_without_key() {
        let region = Region::in_memory("durable").unwrap();
        let p = adapter(&region, None);
        let doc = json!({"a": 1});
        p.save(&doc).await.unwrap();
        assert_eq!(p.raw().await.unwrap().as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(p.load().await.unwrap(), LoadOutcome::Document(doc));
    }

    #[tokio::test]
    async fn test_save_refused_when_plaintext_disabled() {
        let region = Region::in_memory("durable").unwrap();
        let p = adapter(&region, None).with_allow_plaintext(false);
        assert!(matches!(
            p.save(&json!({})).await,
            Err(PersistenceError::Locked)
        ));
        assert_eq!(p.raw().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_with_ignores_provider() {
        let region = Region::in_memory("durable").unwrap();
        let p = adapter(&region, key(1)).with_allow_plaintext(false);
        let next = key(2).unwrap();
        let doc = json!({"notes": "resealed"});

        p.save_with(&doc, &next).await.unwrap();
        assert!(matches!(p.load().await.unwrap(), LoadOutcome::Unreadable(_)));
        assert_eq!(
            adapter(&region, Some(next)).load().await.unwrap(),
            LoadOutcome::Document(doc)
        );
    }

    #[tokio::test]
    async fn test_load_empty() {
        let region = Region::in_memory("durable").unwrap();
        assert_eq!(
            adapter(&region, key(1)).load().await.unwrap(),
            LoadOutcome::Empty
        );
    }

    #[tokio::test]
    async fn test_legacy_plaintext_loads_under_key() {
        let region = Region::in_memory("durable").unwrap();
        region
            .write(slots::SESSION_DOCUMENT, r#"{"patient":{"name":"old"}}"#)
            .await
            .unwrap();
        let outcome = adapter(&region, key(1)).load().await.unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Document(json!({"patient": {"name": "old"}}))
        );
    }

    #[tokio::test]
    async fn test_unreadable_cases() {
        let region = Region::in_memory("durable").unwrap();
        adapter(&region, key(1)).save(&json!({"a": 1})).await.unwrap();

        // wrong key
        assert!(matches!(
            adapter(&region, key(2)).load().await.unwrap(),
            LoadOutcome::Unreadable(_)
        ));
        // locked
        assert!(matches!(
            adapter(&region, None).load().await.unwrap(),
            LoadOutcome::Unreadable(_)
        ));

        // corrupt JSON and non-object JSON
        for raw in ["{not json", "[1,2,3]", "42"] {
            region.write(slots::SESSION_DOCUMENT, raw).await.unwrap();
            assert!(
                matches!(
                    adapter(&region, None).load().await.unwrap(),
                    LoadOutcome::Unreadable(_)
                ),
                "{raw} should be unreadable"
            );
        }
    }
}
