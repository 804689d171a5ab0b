//! Framing errors raised by the RESP codec.

use thiserror::Error;

/// Result type for codec operations.
pub type ProtoResult<T> = Result<T, ProtocolError>;

/// Malformed RESP input.
///
/// Any of these leaves the byte stream in an unknown position, so the
/// connection that produced it must be torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The leading byte is not one of `+ - : $ *`.
    #[error("invalid reply type byte 0x{0:02x}")]
    InvalidTypeByte(u8),
    /// An integer or length field is not a decimal i64.
    #[error("invalid integer in reply header")]
    InvalidInteger,
    /// A bulk or array length below -1.
    #[error("invalid length {0}")]
    InvalidLength(i64),
    /// A line or bulk payload was not terminated by CRLF.
    #[error("frame not terminated by CRLF")]
    MissingCrlf,
    /// A well-formed reply whose shape is impossible at this point.
    #[error("unexpected reply: expected {expected}")]
    UnexpectedReply { expected: &'static str },
}
