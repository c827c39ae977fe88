use std::path::PathBuf;

use drover_core::DroverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration from {origin}")]
    Parse {
        origin: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Invalid(#[from] DroverError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
