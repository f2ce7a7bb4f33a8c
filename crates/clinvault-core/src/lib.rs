//! clinvault-core: shared vocabulary of the encrypted session store
//!
//! Config schema, the umbrella error type, and the small value types that
//! every other crate agrees on (source mode, timestamps).

pub mod config;
pub mod error;
pub mod types;

pub use error::{ClinvaultError, ClinvaultResult};
pub use types::{unix_millis, SourceMode};
