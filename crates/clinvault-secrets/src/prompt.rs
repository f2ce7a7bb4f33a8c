//! Interactive PIN entry

use secrecy::SecretString;

use crate::error::KeyError;

/// Environment variable consulted before prompting (non-interactive use).
pub const PIN_ENV: &str = "CLINVAULT_PIN";

/// Read a PIN from `$CLINVAULT_PIN` or, failing that, the terminal without echo.
pub fn read_pin(prompt: &str) -> Result<SecretString, KeyError> {
    if let Ok(pin) = std::env::var(PIN_ENV) {
        tracing::debug!("using PIN from {PIN_ENV}");
        return Ok(SecretString::from(pin));
    }
    let pin = rpassword::prompt_password(prompt).map_err(|e| KeyError::Prompt(e.to_string()))?;
    Ok(SecretString::from(pin.trim().to_string()))
}
