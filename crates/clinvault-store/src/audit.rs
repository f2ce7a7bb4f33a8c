//! Audit trail kept inside the document under `auditLog`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use clinvault_core::SourceMode;

/// Document key holding the audit array.
pub const AUDIT_KEY: &str = "auditLog";

/// Field name recorded for a `set_batch` summary entry.
pub const BATCH_FIELD: &str = "<batch>";

/// One recorded change. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unix milliseconds
    pub timestamp: u64,
    /// Dot path of the changed field
    pub field: String,
    /// Absent when the field had never been set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub operator: String,
    pub source_mode: SourceMode,
}

/// Objects and arrays are recorded as opaque markers, scalars verbatim.
pub fn summarize(value: Option<&Value>) -> Option<Value> {
    value.map(|v| match v {
        Value::Object(_) => Value::from("[object]"),
        Value::Array(_) => Value::from("[array]"),
        scalar => scalar.clone(),
    })
}

/// Append `entry` to the document's log, then drop the oldest entries until
/// at most `cap` remain.
pub fn append(doc: &mut Value, entry: &AuditEntry, cap: usize) -> Result<(), serde_json::Error> {
    let entry = serde_json::to_value(entry)?;
    let log = &mut doc[AUDIT_KEY];
    if !log.is_array() {
        *log = Value::Array(Vec::new());
    }
    if let Value::Array(items) = log {
        items.push(entry);
        if items.len() > cap {
            let excess = items.len() - cap;
            items.drain(..excess);
        }
    }
    Ok(())
}

/// Decode the log. Entries that no longer parse are skipped.
pub fn entries(doc: &Value) -> Vec<AuditEntry> {
    let Some(items) = doc.get(AUDIT_KEY).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!("skipping malformed audit entry: {e}");
                None
            }
        })
        .collect()
}
