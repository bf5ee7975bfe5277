//! Error types shared by the shift crates.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid environment reference '{0}': expected <site>.<stage>")]
    InvalidEnvironment(String),

    #[error("invalid tenant id '{0}': only ASCII letters and digits are allowed")]
    InvalidTenant(String),

    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("invalid duration '{0}': expected <n>ms, <n>s, <n>m or <n>h")]
    InvalidDuration(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
