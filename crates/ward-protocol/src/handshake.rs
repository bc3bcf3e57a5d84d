use serde::{Deserialize, Serialize};

/// Version announcement exchanged first in both directions.
/// Wire: `{ "version": "0.1.0" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
}

impl Hello {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    /// Hello carrying this build's version.
    pub fn ours() -> Self {
        Self::new(ward_core::config::AGENT_VERSION)
    }
}
