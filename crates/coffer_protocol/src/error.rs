//! Protocol error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("protocol version mismatch: expected {expected:#04x}, got {got:#04x}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid opcode: {0}")]
    InvalidOpCode(u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid source reference: '{0}'")]
    InvalidSourceRef(String),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
