//! `ward-core` — agent configuration, shared errors and protocol limits.

pub mod config;
pub mod error;

pub use config::AgentConfig;
pub use error::{Result, WardError};
