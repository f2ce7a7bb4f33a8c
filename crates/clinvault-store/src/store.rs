//! SessionStore: the single owner of the in-memory session document.
//!
//! Every accepted write goes: mutate → audit → persist → notify. A failed
//! persist keeps the in-memory change, marks the store dirty, surfaces the
//! error and notifies nobody; `persist()` retries.
//!
//! The audit log itself is never a write target: entries are appended by
//! the store only.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use thiserror::Error;

use clinvault_core::config::SessionConfig;
use clinvault_core::{unix_millis, SourceMode};
use clinvault_crypto::SessionKey;

use crate::audit::{self, AuditEntry, BATCH_FIELD};
use crate::document;
use crate::path::{KeyPath, PathError};
use crate::persistence::{LoadOutcome, Persistence, PersistenceError};
use crate::schema::{self, default_document, SCHEMA_VERSION};

/// Top-level keys that `import_json` never overwrites.
const IMPORT_SKIPPED: &[&str] = &["version", "meta", audit::AUDIT_KEY];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// The stored session could not be read; writing would destroy it.
    #[error("session is read-only: {0}")]
    ReadOnly(String),

    #[error("invalid path: {0}")]
    Path(#[from] PathError),

    #[error("'{0}' is append-only and cannot be written directly")]
    ProtectedPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("import must be a JSON object")]
    InvalidImport,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Skip the audit entry and the notification (the write still persists)
    pub silent: bool,
}

impl SetOptions {
    pub fn silent() -> Self {
        Self { silent: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn Fn(Option<&KeyPath>) + Send + Sync>;

pub struct SessionStore {
    doc: Value,
    persistence: Persistence,
    operator: String,
    source_mode: SourceMode,
    audit_cap: usize,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
    dirty: bool,
    read_only: Option<String>,
}

impl SessionStore {
    /// A store holding a fresh default document. Call [`load`](Self::load)
    /// to pick up whatever is persisted.
    pub fn new(persistence: Persistence, config: &SessionConfig) -> Self {
        Self {
            doc: default_document(&config.operator, config.source_mode),
            persistence,
            operator: config.operator.clone(),
            source_mode: config.source_mode,
            audit_cap: config.audit_log_cap.max(1),
            subscribers: Vec::new(),
            next_subscription: 0,
            dirty: false,
            read_only: None,
        }
    }

    /// The whole document.
    pub fn session(&self) -> &Value {
        &self.doc
    }

    pub fn get(&self, path: &KeyPath) -> Option<&Value> {
        document::get(&self.doc, path)
    }

    /// Write one field. Returns `Ok(false)` when `value` is a primitive equal
    /// to what is already there (nothing recorded, persisted or notified).
    pub async fn set(
        &mut self,
        path: &KeyPath,
        value: Value,
        opts: SetOptions,
    ) -> Result<bool, StoreError> {
        self.ensure_writable()?;
        ensure_unprotected(path)?;

        let old = self.get(path);
        if document::is_unchanged(old, &value) {
            return Ok(false);
        }
        let old_summary = audit::summarize(old);
        let new_summary = audit::summarize(Some(&value));

        document::set_in(&mut self.doc, path, value);
        if !opts.silent {
            self.record(path.to_string(), old_summary, new_summary)?;
        }
        schema::touch(&mut self.doc);

        self.save().await?;
        if !opts.silent {
            self.notify(Some(path));
        }
        Ok(true)
    }

    /// Apply several writes with one persist and one notification (no path).
    /// The audit log gets a single summary entry.
    pub async fn set_batch(&mut self, updates: Vec<(KeyPath, Value)>) -> Result<(), StoreError> {
        self.ensure_writable()?;
        if updates.is_empty() {
            return Ok(());
        }
        for (path, _) in &updates {
            ensure_unprotected(path)?;
        }

        let count = updates.len();
        for (path, value) in updates {
            document::set_in(&mut self.doc, &path, value);
        }
        self.record(
            BATCH_FIELD.to_string(),
            None,
            Some(Value::from(format!("[batch:{count}]"))),
        )?;
        schema::touch(&mut self.doc);

        self.save().await?;
        self.notify(None);
        tracing::debug!(count, "batch applied");
        Ok(())
    }

    /// Store a derived score. Persisted, but neither audited nor notified.
    pub async fn set_score(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let scores = &mut self.doc["scores"];
        if !scores.is_object() {
            *scores = Value::Object(Default::default());
        }
        scores[key] = value;
        self.save().await
    }

    /// A stored score; `None` if missing or `null`.
    pub fn get_score(&self, key: &str) -> Option<&Value> {
        self.doc
            .get("scores")?
            .get(key)
            .filter(|value| !value.is_null())
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&KeyPath>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Replace the in-memory document with the persisted one merged onto the
    /// current defaults. `Ok(false)` when nothing usable is stored; if the
    /// stored payload is unreadable the store also becomes read-only.
    pub async fn load(&mut self) -> Result<bool, StoreError> {
        let fresh = default_document(&self.operator, self.source_mode);
        match self.persistence.load().await? {
            LoadOutcome::Empty => {
                self.reset_to(fresh, None);
                tracing::info!("no stored session; starting fresh");
                Ok(false)
            }
            LoadOutcome::Document(stored) => {
                let mut doc = fresh;
                document::merge(&mut doc, stored);
                doc["version"] = Value::from(SCHEMA_VERSION);
                self.reset_to(doc, None);
                tracing::info!(
                    audit_entries = self.audit_len(),
                    encrypted = self.persistence.is_encrypting(),
                    "session loaded"
                );
                Ok(true)
            }
            LoadOutcome::Unreadable(reason) => {
                tracing::warn!(%reason, "stored session is unreadable; opening read-only");
                self.reset_to(fresh, Some(reason));
                Ok(false)
            }
        }
    }

    /// Discard everything and start a new empty session. Also the way out of
    /// a read-only session.
    pub async fn clear_session(&mut self) -> Result<(), StoreError> {
        let fresh = default_document(&self.operator, self.source_mode);
        self.reset_to(fresh, None);
        self.save().await?;
        self.notify(None);
        tracing::info!("session cleared");
        Ok(())
    }

    /// Write the current document again (retry after a failure, or re-seal
    /// under a new key).
    pub async fn persist(&mut self) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.save().await
    }

    /// Write the current document sealed under `key`, which need not be the
    /// live key yet (PIN rotation re-seals before the new marker goes live).
    pub async fn persist_with(&mut self, key: &SessionKey) -> Result<(), StoreError> {
        self.ensure_writable()?;
        if let Err(e) = self.persistence.save_with(&self.doc, key).await {
            tracing::error!("re-sealing session failed: {e}");
            return Err(e.into());
        }
        self.dirty = false;
        Ok(())
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        audit::entries(&self.doc)
    }

    /// True if the in-memory document has changes that failed to persist.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn read_only_reason(&self) -> Option<&str> {
        self.read_only.as_deref()
    }

    /// Identity stamped on subsequent audit entries.
    pub fn set_operator(&mut self, operator: impl Into<String>) {
        self.operator = operator.into();
        schema::set_meta(&mut self.doc, "operator", Value::from(self.operator.clone()));
    }

    pub fn set_source_mode(&mut self, mode: SourceMode) {
        self.source_mode = mode;
        schema::set_meta(&mut self.doc, "sourceMode", Value::from(mode.as_str()));
    }

    pub fn export_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.doc)?)
    }

    /// Bulk-load the domain sub-trees of an exported document through
    /// [`set_batch`](Self::set_batch). Returns the number of sub-trees written.
    pub async fn import_json(&mut self, json: &str) -> Result<usize, StoreError> {
        let Value::Object(incoming) = serde_json::from_str::<Value>(json)? else {
            return Err(StoreError::InvalidImport);
        };

        let updates = incoming
            .into_iter()
            .filter(|(key, _)| !IMPORT_SKIPPED.contains(&key.as_str()))
            .map(|(key, value)| Ok((KeyPath::from_segments([key])?, value)))
            .collect::<Result<Vec<_>, PathError>>()?;

        let count = updates.len();
        self.set_batch(updates).await?;
        tracing::info!(count, "session imported");
        Ok(count)
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn ensure_writable(&self) -> Result<(), StoreError> {
        match &self.read_only {
            Some(reason) => Err(StoreError::ReadOnly(reason.clone())),
            None => Ok(()),
        }
    }

    fn reset_to(&mut self, doc: Value, read_only: Option<String>) {
        self.doc = doc;
        self.read_only = read_only;
        self.dirty = false;
    }

    fn record(
        &mut self,
        field: String,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Result<(), StoreError> {
        let entry = AuditEntry {
            timestamp: unix_millis(),
            field,
            old_value,
            new_value,
            operator: self.operator.clone(),
            source_mode: self.source_mode,
        };
        audit::append(&mut self.doc, &entry, self.audit_cap)?;
        Ok(())
    }

    async fn save(&mut self) -> Result<(), StoreError> {
        match self.persistence.save(&self.doc).await {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                tracing::error!("saving session failed: {e}");
                Err(e.into())
            }
        }
    }

    fn notify(&self, path: Option<&KeyPath>) {
        for (id, callback) in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(path))).is_err() {
                tracing::error!(subscription = id.0, "subscriber panicked");
            }
        }
    }

    fn audit_len(&self) -> usize {
        self.doc
            .get(audit::AUDIT_KEY)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }
}

fn ensure_unprotected(path: &KeyPath) -> Result<(), StoreError> {
    if path.root() == audit::AUDIT_KEY {
        return Err(StoreError::ProtectedPath(audit::AUDIT_KEY.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use clinvault_crypto::{DerivedKey, KeyProvider, SessionKey};
    use clinvault_storage::{slots, Region};
    use serde_json::json;

    fn kp(s: &str) -> KeyPath {
        s.parse().unwrap()
    }

    fn config(cap: usize) -> SessionConfig {
        SessionConfig {
            operator: "dr-a".into(),
            source_mode: SourceMode::Clinician,
            audit_log_cap: cap,
        }
    }

    fn keyed() -> Arc<dyn KeyProvider> {
        Arc::new(Some(SessionKey::new(
            DerivedKey::from_bytes([7; 32]),
            [7; 16],
        )))
    }

    fn store_on(region: &Region, cap: usize) -> SessionStore {
        SessionStore::new(Persistence::new(region.clone(), keyed()), &config(cap))
    }

    fn recorder(store: &mut SessionStore) -> Arc<Mutex<Vec<Option<String>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(move |path| {
            sink.lock().unwrap().push(path.map(|p| p.to_string()));
        });
        seen
    }

    #[tokio::test]
    async fn test_set_get_and_audit() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        let seen = recorder(&mut store);

        assert_eq!(store.get(&kp("patient.name")), None);
        assert!(store
            .set(&kp("patient.name"), json!("A"), SetOptions::default())
            .await
            .unwrap());
        assert_eq!(store.get(&kp("patient.name")), Some(&json!("A")));

        let log = store.audit_log();
        let last = log.last().unwrap();
        assert_eq!(last.field, "patient.name");
        assert_eq!(last.old_value, None);
        assert_eq!(last.new_value, Some(json!("A")));
        assert_eq!(last.operator, "dr-a");
        assert_eq!(*seen.lock().unwrap(), vec![Some("patient.name".to_string())]);
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn test_unchanged_set_is_noop() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        let seen = recorder(&mut store);

        store
            .set(&kp("instruments.ess.q1"), json!(2), SetOptions::default())
            .await
            .unwrap();
        let changed = store
            .set(&kp("instruments.ess.q1"), json!(2), SetOptions::default())
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(store.audit_log().len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        // objects always count as a change
        store
            .set(&kp("imaging.mri"), json!({}), SetOptions::default())
            .await
            .unwrap();
        assert!(store
            .set(&kp("imaging.mri"), json!({}), SetOptions::default())
            .await
            .unwrap());
        let log = store.audit_log();
        assert_eq!(log.last().unwrap().old_value, Some(json!("[object]")));
    }

    #[tokio::test]
    async fn test_silent_set() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        let seen = recorder(&mut store);

        store
            .set(&kp("notes.draft"), json!("x"), SetOptions::silent())
            .await
            .unwrap();
        assert!(store.audit_log().is_empty());
        assert!(seen.lock().unwrap().is_empty());

        let mut reloaded = store_on(&region, 100);
        assert!(reloaded.load().await.unwrap());
        assert_eq!(reloaded.get(&kp("notes.draft")), Some(&json!("x")));
    }

    #[tokio::test]
    async fn test_set_batch() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        let seen = recorder(&mut store);

        store
            .set_batch(vec![
                (kp("patient.name"), json!("B")),
                (kp("patient.age"), json!(71)),
                (kp("diagnosis.primary"), json!("insomnia")),
            ])
            .await
            .unwrap();

        assert_eq!(store.get(&kp("patient.age")), Some(&json!(71)));
        assert_eq!(*seen.lock().unwrap(), vec![None]);
        let log = store.audit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].field, BATCH_FIELD);
        assert_eq!(log[0].new_value, Some(json!("[batch:3]")));

        store.set_batch(Vec::new()).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scores() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        let seen = recorder(&mut store);

        store.set_score("psqi.total", json!(11)).await.unwrap();
        store.set_score("ess.total", Value::Null).await.unwrap();

        assert_eq!(store.get_score("psqi.total"), Some(&json!(11)));
        assert_eq!(store.get_score("ess.total"), None);
        assert_eq!(store.get_score("missing"), None);
        assert!(store.audit_log().is_empty());
        assert!(seen.lock().unwrap().is_empty());

        let mut reloaded = store_on(&region, 100);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get_score("psqi.total"), Some(&json!(11)));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = store.subscribe(move |_| *c.lock().unwrap() += 1);

        store
            .set(&kp("notes.a"), json!(1), SetOptions::default())
            .await
            .unwrap();
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store
            .set(&kp("notes.a"), json!(2), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_contained() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        store.subscribe(|_| panic!("listener bug"));
        let seen = recorder(&mut store);

        store
            .set(&kp("patient.name"), json!("C"), SetOptions::default())
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);

        let mut reloaded = store_on(&region, 100);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get(&kp("patient.name")), Some(&json!("C")));
    }

    #[tokio::test]
    async fn test_audit_cap_keeps_newest() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 5);
        for i in 0..12 {
            store
                .set(&kp("notes.counter"), json!(i), SetOptions::default())
                .await
                .unwrap();
        }
        let log = store.audit_log();
        assert_eq!(log.len(), 5);
        assert_eq!(log.first().unwrap().new_value, Some(json!(7)));
        assert_eq!(log.last().unwrap().new_value, Some(json!(11)));
    }

    #[tokio::test]
    async fn test_load_merges_old_schema() {
        let region = Region::in_memory("durable").unwrap();
        region
            .write(
                slots::SESSION_DOCUMENT,
                r#"{"version":0,"patient":{"name":"Old"},"instruments":{"psqi":{"q1":3}}}"#,
            )
            .await
            .unwrap();

        let mut store = store_on(&region, 100);
        assert!(store.load().await.unwrap());
        assert_eq!(store.get(&kp("patient.name")), Some(&json!("Old")));
        assert_eq!(store.get(&kp("instruments.psqi.q1")), Some(&json!(3)));
        assert_eq!(store.get(&kp("instruments.moca")), Some(&json!({})));
        assert_eq!(store.get(&kp("version")), Some(&json!(SCHEMA_VERSION)));
        assert!(store.get(&kp("meta.sessionId")).is_some());
    }

    #[tokio::test]
    async fn test_load_empty_is_false() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        assert!(!store.load().await.unwrap());
        assert!(store.read_only_reason().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_session_is_read_only() {
        let region = Region::in_memory("durable").unwrap();
        store_on(&region, 100)
            .set(&kp("patient.name"), json!("D"), SetOptions::default())
            .await
            .unwrap();
        let sealed = region.read(slots::SESSION_DOCUMENT).await.unwrap();

        // same slot, no key
        let mut locked = SessionStore::new(
            Persistence::new(region.clone(), Arc::new(None::<SessionKey>)),
            &config(100),
        );
        assert!(!locked.load().await.unwrap());
        assert!(locked.read_only_reason().is_some());
        assert!(matches!(
            locked
                .set(&kp("patient.name"), json!("E"), SetOptions::default())
                .await,
            Err(StoreError::ReadOnly(_))
        ));
        assert!(matches!(
            locked.set_score("x", json!(1)).await,
            Err(StoreError::ReadOnly(_))
        ));
        assert!(matches!(locked.persist().await, Err(StoreError::ReadOnly(_))));
        assert_eq!(region.read(slots::SESSION_DOCUMENT).await.unwrap(), sealed);

        // explicit way out
        locked.clear_session().await.unwrap();
        assert!(locked.read_only_reason().is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_change() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = SessionStore::new(
            Persistence::new(region.clone(), Arc::new(None::<SessionKey>))
                .with_allow_plaintext(false),
            &config(100),
        );
        let seen = recorder(&mut store);

        let err = store
            .set(&kp("patient.name"), json!("F"), SetOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Persistence(PersistenceError::Locked)
        ));
        assert_eq!(store.get(&kp("patient.name")), Some(&json!("F")));
        assert!(store.is_dirty());
        assert_eq!(region.read(slots::SESSION_DOCUMENT).await.unwrap(), None);

        assert!(store
            .set_batch(vec![(kp("notes.summary"), json!("x"))])
            .await
            .is_err());
        assert!(store.clear_session().await.is_err());
        assert!(seen.lock().unwrap().is_empty(), "failed writes notify nobody");
    }

    #[tokio::test]
    async fn test_audit_log_is_not_writable() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        for n in 0..3 {
            store
                .set(&kp("instruments.ess.q1"), json!(n), SetOptions::default())
                .await
                .unwrap();
        }
        let before = store.audit_log();
        let saved = region.read(slots::SESSION_DOCUMENT).await.unwrap();
        let seen = recorder(&mut store);

        for (path, value) in [
            ("auditLog", json!([])),
            ("auditLog.0.newValue", json!("forged")),
            ("auditLog.7", json!({"field": "patient.name"})),
        ] {
            for opts in [SetOptions::default(), SetOptions::silent()] {
                assert!(
                    matches!(
                        store.set(&kp(path), value.clone(), opts).await,
                        Err(StoreError::ProtectedPath(_))
                    ),
                    "{path} should be refused"
                );
            }
        }

        // one bad path sinks the whole batch
        assert!(matches!(
            store
                .set_batch(vec![
                    (kp("patient.name"), json!("I")),
                    (kp("auditLog"), json!([])),
                ])
                .await,
            Err(StoreError::ProtectedPath(_))
        ));
        assert_eq!(store.get(&kp("patient.name")), None);

        assert_eq!(store.audit_log(), before);
        assert_eq!(region.read(slots::SESSION_DOCUMENT).await.unwrap(), saved);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_with_reseals_under_given_key() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        store
            .set(&kp("patient.name"), json!("J"), SetOptions::default())
            .await
            .unwrap();

        let next = SessionKey::new(DerivedKey::from_bytes([8; 32]), [8; 16]);
        store.persist_with(&next).await.unwrap();

        // the live key no longer opens it; the new one does
        let mut reopened = store_on(&region, 100);
        reopened.load().await.unwrap();
        assert!(reopened.read_only_reason().is_some());

        let mut reopened = SessionStore::new(
            Persistence::new(region.clone(), Arc::new(Some(next))),
            &config(100),
        );
        assert!(reopened.load().await.unwrap());
        assert_eq!(reopened.get(&kp("patient.name")), Some(&json!("J")));
    }

    #[tokio::test]
    async fn test_clear_session() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        store
            .set(&kp("patient.name"), json!("G"), SetOptions::default())
            .await
            .unwrap();
        let old_id = store.get(&kp("meta.sessionId")).cloned();
        let seen = recorder(&mut store);

        store.clear_session().await.unwrap();
        assert_eq!(store.get(&kp("patient.name")), None);
        assert!(store.audit_log().is_empty());
        assert_ne!(store.get(&kp("meta.sessionId")).cloned(), old_id);
        assert_eq!(*seen.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_operator_and_source_mode() {
        let region = Region::in_memory("durable").unwrap();
        let mut store = store_on(&region, 100);
        store.set_operator("nurse-b");
        store.set_source_mode(SourceMode::Patient);
        store
            .set(&kp("instruments.phq9.q1"), json!(1), SetOptions::default())
            .await
            .unwrap();

        let last = store.audit_log().pop().unwrap();
        assert_eq!(last.operator, "nurse-b");
        assert_eq!(last.source_mode, SourceMode::Patient);
        assert_eq!(store.get(&kp("meta.operator")), Some(&json!("nurse-b")));
        assert_eq!(store.get(&kp("meta.sourceMode")), Some(&json!("patient")));
    }

    #[tokio::test]
    async fn test_export_import() {
        let region = Region::in_memory("durable").unwrap();
        let mut source = store_on(&region, 100);
        source
            .set(&kp("patient.name"), json!("H"), SetOptions::default())
            .await
            .unwrap();
        source.set_score("gad7.total", json!(4)).await.unwrap();
        let exported = source.export_json().unwrap();

        let other = Region::in_memory("durable").unwrap();
        let mut target = store_on(&other, 100);
        let written = target.import_json(&exported).await.unwrap();
        // patient, instruments, imaging, diagnosis, notes, scores
        assert_eq!(written, 6);
        assert_eq!(target.get(&kp("patient.name")), Some(&json!("H")));
        assert_eq!(target.get_score("gad7.total"), Some(&json!(4)));
        // target keeps its own identity and audit trail
        assert_ne!(
            target.get(&kp("meta.sessionId")),
            source.get(&kp("meta.sessionId"))
        );
        assert_eq!(target.audit_log().len(), 1);

        assert!(matches!(
            target.import_json("[1]").await,
            Err(StoreError::InvalidImport)
        ));
        assert!(matches!(
            target.import_json("{oops").await,
            Err(StoreError::Serialization(_))
        ));
    }
}
