//! Default document shape.

use serde_json::{json, Value};
use uuid::Uuid;

use clinvault_core::{unix_millis, SourceMode};

/// Current document schema version, stamped on every load.
pub const SCHEMA_VERSION: u64 = 1;

/// Standardized instruments with a sub-tree under `instruments`.
pub const INSTRUMENTS: &[&str] = &["psqi", "ess", "isi", "phq9", "gad7", "moca", "mmse"];

/// A fresh, empty session document.
pub fn default_document(operator: &str, source_mode: SourceMode) -> Value {
    let now = unix_millis();
    let instruments: serde_json::Map<String, Value> = INSTRUMENTS
        .iter()
        .map(|name| (name.to_string(), json!({})))
        .collect();

    json!({
        "version": SCHEMA_VERSION,
        "meta": {
            "createdAt": now,
            "lastModified": now,
            "operator": operator,
            "sourceMode": source_mode,
            "sessionId": Uuid::new_v4().to_string(),
        },
        "patient": {},
        "instruments": instruments,
        "imaging": {},
        "diagnosis": {},
        "notes": {},
        "scores": {},
        "auditLog": [],
    })
}

/// Bump `meta.lastModified`.
pub(crate) fn touch(doc: &mut Value) {
    set_meta(doc, "lastModified", Value::from(unix_millis()));
}

pub(crate) fn set_meta(doc: &mut Value, key: &str, value: Value) {
    let meta = &mut doc["meta"];
    if !meta.is_object() {
        *meta = json!({});
    }
    meta[key] = value;
}
