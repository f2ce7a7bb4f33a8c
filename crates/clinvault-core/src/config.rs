use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ClinvaultError, ClinvaultResult};
use crate::types::SourceMode;

/// Lowest PBKDF2 iteration count considered acceptable outside of tests.
pub const MIN_KDF_ITERATIONS: u32 = 600_000;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinvaultConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable region: PIN-check marker, session document, preferences
    pub data_dir: PathBuf,
    /// Session-scoped region: cached key material. Should live on a
    /// filesystem the OS clears at logout (default: $XDG_RUNTIME_DIR/clinvault)
    pub session_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iterations (default: 600000)
    pub kdf_iterations: u32,
    /// Store the document as plaintext JSON when no key is loaded (default: true).
    /// When false, saving while locked is an error.
    pub allow_plaintext: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Operator identifier stamped on audit entries
    pub operator: String,
    /// Default source mode for new writes
    pub source_mode: SourceMode,
    /// Maximum audit entries retained in the document (oldest dropped first)
    pub audit_log_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.local/share/clinvault"),
            session_dir: default_session_dir(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            allow_plaintext: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operator: String::new(),
            source_mode: SourceMode::Clinician,
            audit_log_cap: 1000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

fn default_session_dir() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("clinvault"),
        _ => {
            let user = std::env::var("USER").unwrap_or_else(|_| "default".into());
            std::env::temp_dir().join(format!("clinvault-{user}"))
        }
    }
}

impl ClinvaultConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults (with a warning); a malformed file
    /// is an error.
    pub fn load(path: &Path) -> ClinvaultResult<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found (using defaults)");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ClinvaultError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClinvaultError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break store invariants.
    pub fn validate(&self) -> ClinvaultResult<()> {
        if self.session.audit_log_cap == 0 {
            return Err(ClinvaultError::Config(
                "session.audit_log_cap must be at least 1".into(),
            ));
        }
        if self.crypto.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(ClinvaultError::Config(format!(
                "crypto.kdf_iterations must be at least {MIN_KDF_ITERATIONS} (got {})",
                self.crypto.kdf_iterations
            )));
        }
        Ok(())
    }

    /// Durable data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    /// Session cache directory with `~` expanded.
    pub fn session_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.session_dir)
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}
