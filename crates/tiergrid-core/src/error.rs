//! Errors raised while loading or validating a topology.

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read topology file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse topology file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render topology file: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("invalid topology: {0}")]
    Invalid(String),
}
