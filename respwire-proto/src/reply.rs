//! # Replies
//!
//! Purpose: Typed RESP2 reply values decoded from the server.

use bytes::Bytes;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK or +PONG style responses.
    Simple(Bytes),
    /// -ERR ... responses, text kept verbatim.
    Error(Bytes),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for `$-1`.
    Bulk(Option<Bytes>),
    /// *... arrays, with None for `*-1`.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// True for the null bulk string and the null array only.
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Payload of a simple or non-null bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Simple(data) | Reply::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// Like [`Reply::as_bytes`] but only when the payload is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|data| std::str::from_utf8(data).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Server error text for an error reply.
    pub fn as_error(&self) -> Option<&[u8]> {
        match self {
            Reply::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Elements of a non-null array; any other shape is returned unchanged.
    pub fn into_array(self) -> Result<Vec<Reply>, Reply> {
        match self {
            Reply::Array(Some(items)) => Ok(items),
            other => Err(other),
        }
    }

    /// True for `+<expected>` (e.g. `+OK`, `+QUEUED`).
    pub fn is_status(&self, expected: &[u8]) -> bool {
        matches!(self, Reply::Simple(text) if text.as_ref() == expected)
    }
}
