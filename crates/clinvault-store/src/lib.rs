//! clinvault-store: the session document and everything that touches it
//!
//! ```text
//! SessionStore ──get/set/set_batch/set_score──▶ document (serde_json::Value)
//!      │                                           │
//!      ├── audit log (inside the document, capped) │
//!      ├── subscribers (notified after each write) │
//!      └── Persistence ──KeyProvider──▶ envelope ──▶ durable region
//! ```
//!
//! The store is an explicit value owned by the caller; mutators take
//! `&mut self`, so writes are serialized by the borrow checker.

pub mod audit;
pub mod document;
pub mod path;
pub mod persistence;
pub mod schema;
pub mod store;

pub use audit::AuditEntry;
pub use path::{KeyPath, PathError};
pub use persistence::{LoadOutcome, Persistence, PersistenceError};
pub use schema::{default_document, SCHEMA_VERSION};
pub use store::{SessionStore, SetOptions, StoreError, SubscriptionId};
