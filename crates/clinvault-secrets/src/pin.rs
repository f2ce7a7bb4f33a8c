//! KeyManager: PIN setup, verification, caching, rotation and reset.

use std::sync::{Arc, PoisonError, RwLock};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, OwnedMutexGuard};

use clinvault_crypto::{
    derive_key, envelope, generate_salt, Envelope, KdfParams, KeyProvider, Payload, SessionKey,
    SALT_SIZE,
};
use clinvault_storage::{slots, Region};

use crate::cache;
use crate::error::KeyError;

/// Fixed plaintext sealed into the PIN-check marker.
pub const PIN_SENTINEL: &str = "clinvault-pin-check-v1";

/// Durable slots owned by this application (wiped by `reset_all`).
const DURABLE_SLOTS: &[&str] = &[
    slots::PIN_MARKER,
    slots::PIN_KDF,
    slots::PIN_MARKER_PENDING,
    slots::PIN_KDF_PENDING,
    slots::SESSION_DOCUMENT,
    slots::THEME,
];
/// Durable slots that survive `reset_all`.
const PRESERVED_SLOTS: &[&str] = &[slots::THEME];
const SESSION_SLOTS: &[&str] = &[slots::SESSION_KEY, slots::SESSION_SALT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    /// A PIN derivation (or a staged PIN change) is in flight
    Unlocking,
    Unlocked,
}

/// True iff `pin` is 4 to 6 ASCII digits.
pub fn validate_pin_format(pin: &str) -> bool {
    (4..=6).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

/// KDF parameters recorded next to a marker, tied to the marker's salt.
#[derive(Debug, Deserialize)]
struct KdfRecord {
    salt: String,
    iterations: u32,
}

/// Which marker/KDF slot pair an operation addresses.
#[derive(Clone, Copy)]
struct MarkerSlots {
    marker: &'static str,
    kdf: &'static str,
}

const LIVE: MarkerSlots = MarkerSlots {
    marker: slots::PIN_MARKER,
    kdf: slots::PIN_KDF,
};
const STAGED: MarkerSlots = MarkerSlots {
    marker: slots::PIN_MARKER_PENDING,
    kdf: slots::PIN_KDF_PENDING,
};

/// A PIN change whose new marker is staged but not yet live.
///
/// Until [`KeyManager::commit_pin_change`] runs, the old PIN stays the one
/// that unlocks. Holds the unlock gate for its whole lifetime.
pub struct PendingPinChange {
    key: SessionKey,
    _gate: OwnedMutexGuard<()>,
}

impl PendingPinChange {
    /// Key derived from the new PIN. Seal data under it before committing.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl std::fmt::Debug for PendingPinChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPinChange")
            .field("salt", &self.key.salt_b64())
            .finish_non_exhaustive()
    }
}

/// Owner of the PIN lifecycle and the in-memory key.
///
/// At most one unlock (setup, verify, change) runs at a time; a concurrent
/// attempt fails fast with [`KeyError::UnlockInProgress`]. An unlock future
/// that is dropped before completion installs nothing.
///
/// `params` only applies to markers written by this manager. Verification
/// always uses the iteration count recorded with the marker.
pub struct KeyManager {
    durable: Region,
    session: Region,
    params: KdfParams,
    key: RwLock<Option<SessionKey>>,
    unlock_gate: Arc<Mutex<()>>,
}

impl KeyManager {
    pub fn new(durable: Region, session: Region, params: KdfParams) -> Self {
        Self {
            durable,
            session,
            params,
            key: RwLock::new(None),
            unlock_gate: Arc::new(Mutex::new(())),
        }
    }

    /// True iff a PIN-check marker exists in durable storage.
    pub async fn has_pin_setup(&self) -> Result<bool, KeyError> {
        Ok(self.durable.exists(slots::PIN_MARKER).await?)
    }

    pub fn is_unlocked(&self) -> bool {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn state(&self) -> LockState {
        if self.is_unlocked() {
            LockState::Unlocked
        } else if self.unlock_gate.try_lock().is_err() {
            LockState::Unlocking
        } else {
            LockState::Locked
        }
    }

    /// First-time setup: derive a key from `pin` and a fresh salt, write the
    /// marker, cache the key, and unlock.
    pub async fn setup_pin(&self, pin: &SecretString) -> Result<(), KeyError> {
        if !validate_pin_format(pin.expose_secret()) {
            return Err(KeyError::InvalidPinFormat);
        }
        let _gate = self.acquire_gate()?;

        if self.has_pin_setup().await? {
            return Err(KeyError::PinAlreadySetup);
        }

        let key = self.derive(pin, generate_salt(), self.params).await?;
        self.write_marker(LIVE, &key).await?;
        self.unlock_with(key).await;
        tracing::info!(iterations = self.params.iterations, "PIN set up; session unlocked");
        Ok(())
    }

    /// Check `pin` against the stored marker and unlock on success.
    pub async fn verify_pin(&self, pin: &SecretString) -> Result<(), KeyError> {
        let _gate = self.acquire_gate()?;

        self.settle_pending().await?;
        let key = self.check_pin(pin).await?;
        self.unlock_with(key).await;
        tracing::info!("PIN verified; session unlocked");
        Ok(())
    }

    /// Replace the PIN in one step. `old` must verify; the marker is
    /// rewritten under a key derived from `new` and a fresh salt.
    ///
    /// Data sealed under the old key is not touched. Callers holding such
    /// data should use [`begin_pin_change`](Self::begin_pin_change), re-seal,
    /// then [`commit_pin_change`](Self::commit_pin_change).
    pub async fn change_pin(&self, old: &SecretString, new: &SecretString) -> Result<(), KeyError> {
        let pending = self.begin_pin_change(old, new).await?;
        self.commit_pin_change(pending).await
    }

    /// Check `old`, derive the key for `new`, and stage the new marker. The
    /// live marker, the cache and the in-memory key are left alone.
    pub async fn begin_pin_change(
        &self,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<PendingPinChange, KeyError> {
        if !validate_pin_format(new.expose_secret()) {
            return Err(KeyError::InvalidPinFormat);
        }
        let gate = self
            .unlock_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| KeyError::UnlockInProgress)?;

        self.settle_pending().await?;
        self.check_pin(old).await?;
        let key = self.derive(new, generate_salt(), self.params).await?;
        self.write_marker(STAGED, &key).await?;
        tracing::debug!("PIN change staged");
        Ok(PendingPinChange { key, _gate: gate })
    }

    /// Make a staged PIN change live and unlock with the new key.
    pub async fn commit_pin_change(&self, pending: PendingPinChange) -> Result<(), KeyError> {
        self.promote_staged().await?;
        self.unlock_with(pending.key).await;
        tracing::info!("PIN changed");
        Ok(())
    }

    /// Drop a staged PIN change; the old PIN stays in force.
    pub async fn abort_pin_change(&self, pending: PendingPinChange) -> Result<(), KeyError> {
        self.discard_staged().await?;
        drop(pending);
        tracing::info!("PIN change abandoned");
        Ok(())
    }

    /// Reload a key cached earlier in this login session. Never fails: any
    /// problem reads as "nothing cached".
    pub async fn restore_cached_key(&self) -> bool {
        let cached = match cache::load(&self.session).await {
            Ok(Some(key)) => key,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!("reading session key cache failed: {e}");
                return false;
            }
        };

        if let Err(e) = self.settle_pending().await {
            tracing::warn!("resolving a staged PIN change failed: {e}");
            return false;
        }

        // A cache left over from before a reset/PIN change belongs to a dead salt
        match self.marker_salt(LIVE).await {
            Some(salt) if salt[..].ct_eq(&cached.salt()[..]).into() => {}
            _ => {
                tracing::info!("cached session key does not match the PIN marker; discarding");
                if let Err(e) = cache::clear(&self.session).await {
                    tracing::warn!("clearing stale session key cache failed: {e}");
                }
                return false;
            }
        }

        self.install(cached);
        tracing::info!("restored session key from cache");
        true
    }

    /// Drop the key from memory and from the session cache.
    pub async fn lock(&self) -> Result<(), KeyError> {
        self.take();
        cache::clear(&self.session).await?;
        tracing::info!("session locked");
        Ok(())
    }

    /// Irreversibly erase all durable state except the display preference,
    /// and the session cache. The only way back from a forgotten PIN.
    pub async fn reset_all(&self) -> Result<(), KeyError> {
        self.take();
        let durable = self.durable.wipe_except(DURABLE_SLOTS, PRESERVED_SLOTS).await?;
        let session = self.session.wipe_except(SESSION_SLOTS, &[]).await?;
        tracing::warn!(durable, session, "all local data erased");
        Ok(())
    }

    /// Seal `plaintext` under the unlocked key.
    pub fn encrypt(&self, plaintext: &str) -> Result<Envelope, KeyError> {
        let key = self.current_key().ok_or(KeyError::NotUnlocked)?;
        Ok(envelope::encrypt(plaintext, &key)?)
    }

    /// Open `input` under the unlocked key (non-envelopes pass through).
    pub fn decrypt(&self, input: &str) -> Result<String, KeyError> {
        match Payload::classify(input) {
            Payload::Plain(text) => Ok(text.to_string()),
            Payload::Envelope(env) => {
                let key = self.current_key().ok_or(KeyError::NotUnlocked)?;
                Ok(envelope::open(&env, &key)?)
            }
        }
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn acquire_gate(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, KeyError> {
        self.unlock_gate
            .try_lock()
            .map_err(|_| KeyError::UnlockInProgress)
    }

    /// Derive and validate against the live marker without touching lock
    /// state. Every failure is `WrongPin` except a missing marker and
    /// storage/task errors.
    async fn check_pin(&self, pin: &SecretString) -> Result<SessionKey, KeyError> {
        let marker = self
            .durable
            .read(slots::PIN_MARKER)
            .await?
            .ok_or(KeyError::NoPinSetup)?;

        if !validate_pin_format(pin.expose_secret()) {
            return Err(KeyError::WrongPin);
        }

        let parsed = match Payload::classify(&marker) {
            Payload::Envelope(env) => salt_of(&env).map(|salt| (env, salt)),
            Payload::Plain(_) => None,
        };

        // Damaged marker: still pay for a derivation so the failure costs the
        // same time as a wrong PIN.
        let Some((env, salt)) = parsed else {
            tracing::warn!("PIN marker is malformed");
            self.derive(pin, generate_salt(), self.params).await?;
            return Err(KeyError::WrongPin);
        };

        let params = self.recorded_params(LIVE, &env).await?;
        let candidate = self.derive(pin, salt, params).await?;
        let opened = envelope::open(&env, &candidate).unwrap_or_default();
        if bool::from(opened.as_bytes().ct_eq(PIN_SENTINEL.as_bytes())) {
            Ok(candidate)
        } else {
            tracing::debug!("PIN check failed");
            Err(KeyError::WrongPin)
        }
    }

    /// Iterations the marker in `at` was derived with. Markers written before
    /// the record existed, or whose record belongs to another salt, fall back
    /// to this manager's parameters.
    async fn recorded_params(&self, at: MarkerSlots, marker: &Envelope) -> Result<KdfParams, KeyError> {
        let Some(raw) = self.durable.read(at.kdf).await? else {
            return Ok(self.params);
        };
        match serde_json::from_str::<KdfRecord>(&raw) {
            Ok(record) if record.salt == marker.salt && record.iterations > 0 => Ok(KdfParams {
                iterations: record.iterations,
            }),
            Ok(_) => {
                tracing::warn!(slot = at.kdf, "KDF record does not match the PIN marker");
                Ok(self.params)
            }
            Err(e) => {
                tracing::warn!(slot = at.kdf, "KDF record is malformed: {e}");
                Ok(self.params)
            }
        }
    }

    async fn derive(
        &self,
        pin: &SecretString,
        salt: [u8; SALT_SIZE],
        params: KdfParams,
    ) -> Result<SessionKey, KeyError> {
        let pin = SecretString::from(pin.expose_secret().to_owned());
        let key = tokio::task::spawn_blocking(move || derive_key(&pin, &salt, &params))
            .await
            .map_err(|e| KeyError::Task(e.to_string()))??;
        Ok(SessionKey::new(key, salt))
    }

    /// Write the KDF record, then the marker it describes.
    async fn write_marker(&self, at: MarkerSlots, key: &SessionKey) -> Result<(), KeyError> {
        let record = serde_json::json!({
            "salt": key.salt_b64(),
            "iterations": self.params.iterations,
        });
        let marker = envelope::encrypt(PIN_SENTINEL, key)?;
        self.durable.write(at.kdf, &record.to_string()).await?;
        self.durable.write(at.marker, &marker.to_json()).await?;
        Ok(())
    }

    /// Copy the staged pair over the live one, then remove the staged pair.
    /// The staged marker goes last so an interrupted promotion is retried.
    async fn promote_staged(&self) -> Result<(), KeyError> {
        let marker = self
            .durable
            .read(STAGED.marker)
            .await?
            .ok_or(KeyError::NoPinSetup)?;
        // a record already moved by an earlier, interrupted promotion stays put
        if let Some(record) = self.durable.read(STAGED.kdf).await? {
            self.durable.write(LIVE.kdf, &record).await?;
        }
        self.durable.write(LIVE.marker, &marker).await?;
        self.durable.delete(STAGED.kdf).await?;
        self.durable.delete(STAGED.marker).await?;
        Ok(())
    }

    async fn discard_staged(&self) -> Result<(), KeyError> {
        self.durable.delete(STAGED.kdf).await?;
        self.durable.delete(STAGED.marker).await?;
        Ok(())
    }

    /// Finish a PIN change interrupted between staging and commit. The staged
    /// marker wins iff the session document is already sealed under its salt;
    /// otherwise the old PIN is still the one that opens the data.
    async fn settle_pending(&self) -> Result<(), KeyError> {
        if !self.durable.exists(STAGED.marker).await? {
            return Ok(());
        }
        let Some(staged) = self.marker_salt(STAGED).await else {
            tracing::warn!("staged PIN marker is malformed; discarding");
            return self.discard_staged().await;
        };

        let sealed_with = match self.durable.read(slots::SESSION_DOCUMENT).await? {
            Some(raw) => match Payload::classify(&raw) {
                Payload::Envelope(env) => salt_of(&env),
                Payload::Plain(_) => None,
            },
            None => None,
        };

        match sealed_with {
            Some(salt) if salt[..].ct_eq(&staged[..]).into() => {
                self.promote_staged().await?;
                tracing::info!("completed an interrupted PIN change");
            }
            _ => {
                self.discard_staged().await?;
                tracing::info!("discarded an interrupted PIN change");
            }
        }
        Ok(())
    }

    async fn marker_salt(&self, at: MarkerSlots) -> Option<[u8; SALT_SIZE]> {
        let marker = self.durable.read(at.marker).await.ok()??;
        match Payload::classify(&marker) {
            Payload::Envelope(env) => salt_of(&env),
            Payload::Plain(_) => None,
        }
    }

    /// Cache (best effort) and install. A failed cache write only costs a
    /// PIN prompt after the next restart.
    async fn unlock_with(&self, key: SessionKey) {
        if let Err(e) = cache::store(&self.session, &key).await {
            tracing::warn!("caching session key failed: {e}");
        }
        self.install(key);
    }

    fn install(&self, key: SessionKey) {
        *self.key.write().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    fn take(&self) -> Option<SessionKey> {
        self.key.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl KeyProvider for KeyManager {
    fn current_key(&self) -> Option<SessionKey> {
        self.key.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn salt_of(env: &Envelope) -> Option<[u8; SALT_SIZE]> {
    env.salt_bytes().ok()?.try_into().ok()
}
