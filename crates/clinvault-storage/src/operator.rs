//! OpenDAL Operator factory for the local storage regions

use opendal::Operator;
use std::path::Path;

use clinvault_core::config::ClinvaultConfig;

use crate::region::{Region, SlotError};

/// Staging directory for atomic writes, inside each filesystem region root.
pub const ATOMIC_DIR: &str = ".atomic";

/// Build a filesystem-backed operator rooted at `root`.
///
/// The directory is created if missing and restricted to the owner on Unix.
/// Writes land in [`ATOMIC_DIR`] first and are renamed over the slot, so a
/// slot holds either its old or its new contents, never a torn mix.
pub fn build_fs_operator(root: &Path) -> Result<Operator, SlotError> {
    let atomic = root.join(ATOMIC_DIR);
    std::fs::create_dir_all(&atomic)
        .map_err(|e| SlotError::Build(format!("creating {}: {e}", atomic.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(root, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| SlotError::Build(format!("chmod {}: {e}", root.display())))?;
    }

    let builder = opendal::services::Fs::default()
        .root(&root.to_string_lossy())
        .atomic_write_dir(&atomic.to_string_lossy());

    let op = Operator::new(builder)
        .map_err(|e| SlotError::Build(format!("creating fs operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();

    Ok(op)
}

/// In-memory operator (tests, throwaway sessions).
pub fn memory_operator() -> Result<Operator, SlotError> {
    Ok(Operator::new(opendal::services::Memory::default())
        .map_err(|e| SlotError::Build(format!("creating memory operator: {e}")))?
        .finish())
}

/// Open the durable and session regions named in the config.
pub fn open_regions(config: &ClinvaultConfig) -> Result<(Region, Region), SlotError> {
    let durable_dir = config.data_dir();
    let session_dir = config.session_dir();
    tracing::debug!(
        durable = %durable_dir.display(),
        session = %session_dir.display(),
        "opening storage regions"
    );

    let durable = Region::new("durable", build_fs_operator(&durable_dir)?);
    let session = Region::new("session", build_fs_operator(&session_dir)?);
    Ok((durable, session))
}
