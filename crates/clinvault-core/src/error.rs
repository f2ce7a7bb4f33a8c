use std::path::PathBuf;

use thiserror::Error;

pub type ClinvaultResult<T> = Result<T, ClinvaultError>;

#[derive(Debug, Error)]
pub enum ClinvaultError {
    #[error("config error: {0}")]
    Config(String),

    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
