use thiserror::Error;

/// Failures returned to a control client. The display text is sent back
/// verbatim in `Response::err`.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("agent scheduler does not have a configuration")]
    NotConfigured,

    #[error("agent scheduler already running")]
    AlreadyRunning,

    #[error("agent scheduler not running")]
    NotRunning,

    #[error("{0}")]
    InvalidConfiguration(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("agent controller has shut down")]
    ControllerGone,
}
