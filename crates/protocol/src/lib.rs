//! Text-framed wire protocol (§4.A) and protocol detection (§4.C).
//!
//! Frames look like:
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body\0
//! ```
//!
//! Body length is either declared by a `content-length` header (binary-safe)
//! or delimited by a trailing NUL byte. A single bare `\n` with no command
//! is a heartbeat.

mod codec;
mod detector;

pub use codec::{CommandFrame, Frame, FrameDecoder, ProtocolError};
pub use detector::{ProtocolDetector, ProtocolRouter};
