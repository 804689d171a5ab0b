//! # RespWire Protocol
//!
//! Purpose: Shared RESP2 framing for the RespWire client: command values,
//! typed replies, and the encoder/decoder that moves between them.
//!
//! ## Design Principles
//! 1. **No I/O**: Every function here is a pure byte transformation.
//! 2. **Binary-Safe**: Arguments and bulk payloads are raw `Bytes`.
//! 3. **Resumable Decoding**: Incomplete input is "need more bytes", never an error.
//! 4. **Explicit Shapes**: Null bulk and null array are variants, not sentinels.

mod codec;
mod command;
mod error;
mod reply;

pub use codec::{decode, decode_slice, encode_command, Decoder};
pub use command::Command;
pub use error::{ProtoResult, ProtocolError};
pub use reply::Reply;
