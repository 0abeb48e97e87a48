//! Wire-level errors (§4.4, §7). A storage-level `StoreError` crosses the
//! wire as `{code, message, details}` in an error-flagged response frame;
//! this type is what the transport itself can fail with.
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("authentication required")]
    AuthRequired,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Encoding(e.to_string())
    }
}
