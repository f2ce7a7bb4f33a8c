//! clinvault-secrets: PIN lifecycle and key custody
//!
//! The only crate that touches the PIN-check marker (durable region) and the
//! cached key material (session region). Everything else sees keys through
//! [`clinvault_crypto::KeyProvider`].
//!
//! ```text
//! Locked ──setup_pin/verify_pin──▶ Unlocking ──ok──▶ Unlocked
//!   ▲                                  │                 │
//!   └────────────── WrongPin ──────────┘   lock/reset ───┘
//! ```

pub mod cache;
pub mod error;
pub mod pin;
pub mod prompt;

pub use error::KeyError;
pub use pin::{validate_pin_format, KeyManager, LockState, PendingPinChange, PIN_SENTINEL};
pub use prompt::{read_pin, PIN_ENV};
