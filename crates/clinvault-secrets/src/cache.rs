//! Session-scoped key cache.
//!
//! Lets a restart inside the same login session skip the PIN prompt. The
//! key is exported as base64 next to the salt that produced it; both live
//! in the session region, never in the durable one.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroize;

use clinvault_crypto::{DerivedKey, SessionKey, SALT_SIZE};
use clinvault_storage::{slots, Region, SlotError};

/// Write the key and its salt to the session region.
pub async fn store(session: &Region, key: &SessionKey) -> Result<(), SlotError> {
    let mut exported = STANDARD.encode(key.key().as_bytes());
    let result = async {
        session.write(slots::SESSION_KEY, &exported).await?;
        session.write(slots::SESSION_SALT, &key.salt_b64()).await
    }
    .await;
    exported.zeroize();
    result?;
    tracing::debug!("cached session key");
    Ok(())
}

/// Read a cached key back. Absent or malformed material is `Ok(None)`.
pub async fn load(session: &Region) -> Result<Option<SessionKey>, SlotError> {
    let (Some(mut key_b64), Some(salt_b64)) = (
        session.read(slots::SESSION_KEY).await?,
        session.read(slots::SESSION_SALT).await?,
    ) else {
        return Ok(None);
    };

    let decoded = decode(&key_b64, &salt_b64);
    key_b64.zeroize();

    match decoded {
        Some(key) => Ok(Some(key)),
        None => {
            tracing::warn!("cached session key is malformed; ignoring it");
            Ok(None)
        }
    }
}

fn decode(key_b64: &str, salt_b64: &str) -> Option<SessionKey> {
    let mut key_bytes = STANDARD.decode(key_b64.trim()).ok()?;
    let key = DerivedKey::from_slice(&key_bytes).ok();
    key_bytes.zeroize();

    let salt: [u8; SALT_SIZE] = STANDARD.decode(salt_b64.trim()).ok()?.try_into().ok()?;
    Some(SessionKey::new(key?, salt))
}

/// Remove both cache slots.
pub async fn clear(session: &Region) -> Result<(), SlotError> {
    session.delete(slots::SESSION_KEY).await?;
    session.delete(slots::SESSION_SALT).await?;
    tracing::debug!("cleared session key cache");
    Ok(())
}
