//! clinvault-storage: OpenDAL-backed storage regions
//!
//! Two regions exist, both addressed by flat slot names:
//!   - **durable**: PIN-check marker and its KDF record, session document,
//!     display preferences
//!   - **session**: exported key material, cleared on lock/reset and by the
//!     OS when the login session ends (lives under `$XDG_RUNTIME_DIR`)

pub mod operator;
pub mod region;

pub use operator::{build_fs_operator, memory_operator, open_regions};
pub use region::{Region, SlotError};

/// Well-known slot names
pub mod slots {
    /// Durable: envelope of the PIN sentinel
    pub const PIN_MARKER: &str = "pin_marker.json";
    /// Durable: KDF iteration count the marker was derived with
    pub const PIN_KDF: &str = "pin_kdf.json";
    /// Durable: staged marker of a PIN change not yet committed
    pub const PIN_MARKER_PENDING: &str = "pin_marker.next.json";
    /// Durable: staged KDF record matching `PIN_MARKER_PENDING`
    pub const PIN_KDF_PENDING: &str = "pin_kdf.next.json";
    /// Durable: the session document (plaintext JSON or envelope JSON)
    pub const SESSION_DOCUMENT: &str = "session.json";
    /// Durable: display theme, the one slot that survives a reset
    pub const THEME: &str = "theme";

    /// Session: exported key material (base64)
    pub const SESSION_KEY: &str = "session_key";
    /// Session: salt that produced the cached key (base64)
    pub const SESSION_SALT: &str = "session_salt";
}
