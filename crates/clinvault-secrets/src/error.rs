use clinvault_crypto::CryptoError;
use clinvault_storage::SlotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("PIN must be 4 to 6 digits")]
    InvalidPinFormat,

    /// Deliberately carries no detail: a wrong PIN and a damaged marker look the same.
    #[error("incorrect PIN")]
    WrongPin,

    #[error("no key loaded: unlock with the PIN first")]
    NotUnlocked,

    #[error("no PIN has been set up")]
    NoPinSetup,

    #[error("a PIN is already set up (reset or change it instead)")]
    PinAlreadySetup,

    #[error("another unlock attempt is already in progress")]
    UnlockInProgress,

    #[error("storage error: {0}")]
    Storage(#[from] SlotError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("key derivation task failed: {0}")]
    Task(String),

    #[error("PIN prompt failed: {0}")]
    Prompt(String),
}
