use serde::{Deserialize, Serialize};

use crate::methods;

/// Client → Agent request.
/// Wire: `{ "type": "configure", "payload": [123, 34, ...] }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn start() -> Self {
        Self::new(methods::START, Vec::new())
    }

    pub fn stop() -> Self {
        Self::new(methods::STOP, Vec::new())
    }

    pub fn terminate() -> Self {
        Self::new(methods::TERMINATE, Vec::new())
    }

    /// `payload` is a serialized scheduler configuration document.
    pub fn configure(payload: Vec<u8>) -> Self {
        Self::new(methods::CONFIGURE, payload)
    }
}

/// Agent → Client response.
/// Wire: `{ "exit_code": 1, "err": "agent scheduler not running" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub exit_code: i32,
    #[serde(default)]
    pub err: String,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            err: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            err: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.exit_code == 0
    }
}
