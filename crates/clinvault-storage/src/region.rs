//! Named storage region: string slots on top of an OpenDAL operator

use opendal::{ErrorKind, Operator};
use thiserror::Error;

use crate::operator::memory_operator;

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("{region} read of '{slot}' failed: {message}")]
    Read {
        region: &'static str,
        slot: String,
        message: String,
    },

    #[error("{region} write of '{slot}' failed: {message}")]
    Write {
        region: &'static str,
        slot: String,
        message: String,
    },

    #[error("{region} delete of '{slot}' failed: {message}")]
    Delete {
        region: &'static str,
        slot: String,
        message: String,
    },

    #[error("{region} listing failed: {message}")]
    List {
        region: &'static str,
        message: String,
    },

    #[error("slot '{slot}' in {region} is not UTF-8")]
    NotUtf8 { region: &'static str, slot: String },

    #[error("storage setup failed: {0}")]
    Build(String),
}

/// A flat namespace of text slots (the analogue of a browser storage area).
#[derive(Clone, Debug)]
pub struct Region {
    name: &'static str,
    op: Operator,
}

impl Region {
    pub fn new(name: &'static str, op: Operator) -> Self {
        Self { name, op }
    }

    /// A region backed by process memory only.
    pub fn in_memory(name: &'static str) -> Result<Self, SlotError> {
        Ok(Self::new(name, memory_operator()?))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Read a slot. Missing slots are `Ok(None)`.
    pub async fn read(&self, slot: &str) -> Result<Option<String>, SlotError> {
        match self.op.read(slot).await {
            Ok(buf) => String::from_utf8(buf.to_vec())
                .map(Some)
                .map_err(|_| SlotError::NotUtf8 {
                    region: self.name,
                    slot: slot.to_string(),
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SlotError::Read {
                region: self.name,
                slot: slot.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn exists(&self, slot: &str) -> Result<bool, SlotError> {
        match self.op.stat(slot).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SlotError::Read {
                region: self.name,
                slot: slot.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Replace a slot's contents wholesale.
    pub async fn write(&self, slot: &str, value: &str) -> Result<(), SlotError> {
        self.op
            .write(slot, value.as_bytes().to_vec())
            .await
            .map_err(|e| SlotError::Write {
                region: self.name,
                slot: slot.to_string(),
                message: e.to_string(),
            })?;
        tracing::trace!(region = self.name, slot, bytes = value.len(), "slot written");
        Ok(())
    }

    /// Delete a slot. Deleting a missing slot is not an error.
    pub async fn delete(&self, slot: &str) -> Result<(), SlotError> {
        match self.op.delete(slot).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SlotError::Delete {
                region: self.name,
                slot: slot.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Names of all slots currently present.
    pub async fn list(&self) -> Result<Vec<String>, SlotError> {
        let entries = self.op.list("/").await.map_err(|e| SlotError::List {
            region: self.name,
            message: e.to_string(),
        })?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.metadata().mode().is_file())
            .map(|entry| entry.path().trim_start_matches('/').to_string())
            .filter(|path| !path.is_empty())
            .collect())
    }

    /// Delete every slot except those named in `keep`.
    ///
    /// `known` slots are deleted explicitly first so they go even if the
    /// backend's listing is incomplete. Returns the number of slots removed.
    pub async fn wipe_except(&self, known: &[&str], keep: &[&str]) -> Result<usize, SlotError> {
        let mut removed = 0;
        for slot in known.iter().filter(|s| !keep.contains(s)) {
            if self.exists(slot).await? {
                self.delete(slot).await?;
                removed += 1;
            }
        }

        for slot in self.list().await? {
            if keep.contains(&slot.as_str()) {
                continue;
            }
            self.delete(&slot).await?;
            removed += 1;
        }

        tracing::info!(region = self.name, removed, kept = ?keep, "region wiped");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::in_memory("durable").unwrap()
    }

    #[tokio::test]
    async fn test_missing_slot_is_none() {
        let r = region();
        assert_eq!(r.read("absent").await.unwrap(), None);
        assert!(!r.exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_read_overwrite() {
        let r = region();
        r.write("theme", "dark").await.unwrap();
        assert_eq!(r.read("theme").await.unwrap().as_deref(), Some("dark"));
        r.write("theme", "light").await.unwrap();
        assert_eq!(r.read("theme").await.unwrap().as_deref(), Some("light"));
        assert!(r.exists("theme").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let r = region();
        r.write("session.json", "{}").await.unwrap();
        r.delete("session.json").await.unwrap();
        r.delete("session.json").await.unwrap();
        assert_eq!(r.read("session.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_and_wipe_except() {
        let r = region();
        r.write("pin_marker.json", "m").await.unwrap();
        r.write("session.json", "s").await.unwrap();
        r.write("theme", "dark").await.unwrap();
        r.write("stray", "x").await.unwrap();

        let mut listed = r.list().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["pin_marker.json", "session.json", "stray", "theme"]);

        let removed = r
            .wipe_except(&["pin_marker.json", "session.json", "theme"], &["theme"])
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(r.list().await.unwrap(), vec!["theme"]);
        assert_eq!(r.read("theme").await.unwrap().as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn test_wipe_empty_region() {
        let r = region();
        assert_eq!(r.wipe_except(&["session.json"], &[]).await.unwrap(), 0);
    }
}
