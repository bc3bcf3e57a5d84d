//! `ward-protocol` — local control protocol spoken over the agent socket.
//!
//! One exchange per connection:
//!
//! ```text
//! client                          agent
//!   | -- Hello { version } ------> |
//!   | <----- Hello { version } --- |
//!   | -- Request { type, payload } |
//!   | <-- Response { exit_code, err }
//! ```
//!
//! Every frame is a u32 length prefix followed by a JSON document.

pub mod codec;
pub mod error;
pub mod frames;
pub mod handshake;
pub mod methods;

pub use error::{ProtocolError, Result};
pub use frames::{Request, Response};
pub use handshake::Hello;
