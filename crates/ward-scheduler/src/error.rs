use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The scheduler configuration document could not be read.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A sync task names a direction other than to/from/with.
    #[error("invalid sync direction: {0}")]
    InvalidSyncDirection(String),

    /// `start` was called twice on the same timed-event engine.
    #[error("timed-event engine already started")]
    AlreadyStarted,

    /// Opening a repository or its storage failed.
    #[error("{0}")]
    Repository(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
