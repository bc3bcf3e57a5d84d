use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown repository: {name}")]
    UnknownRepository { name: String },
}

impl WardError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            WardError::Config(_) => "CONFIG_ERROR",
            WardError::UnknownRepository { .. } => "UNKNOWN_REPOSITORY",
        }
    }
}

pub type Result<T> = std::result::Result<T, WardError>;
