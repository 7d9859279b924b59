//! Error types for the Modbus engine
//!
//! Encoding and decoding failures, protocol exceptions and timeouts are surfaced to the
//! immediate caller and never retried here. Retry policy belongs to the owner.

use crate::pdu::{ExceptionCode, GenericPdu};
use thiserror::Error;

/// Modbus engine error
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// A typed structure could not be serialized (invariant violation)
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Wire bytes do not match the expected shape
    #[error("Decoding error: {message} (pdu: {pdu})")]
    Decoding { message: String, pdu: GenericPdu },

    /// No correlated response arrived within the deadline
    #[error("Timeout waiting for response to function 0x{function_code:02X}")]
    Timeout { function_code: u8 },

    /// The peer answered with an exception response
    #[error("Protocol exception for function 0x{function_code:02X}: {exception}")]
    ProtocolException {
        function_code: u8,
        exception: ExceptionCode,
    },

    /// Transport-level failure, the session is gone
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Read or write span is not word aligned
    #[error("Invalid length: {0} bytes is not a whole number of registers")]
    InvalidLength(usize),

    /// Two registers claim overlapping address ranges
    #[error(
        "Register overlap: 0x{first_start:04X}+{first_len} and 0x{second_start:04X}+{second_len}"
    )]
    RegisterOverlap {
        first_start: u16,
        first_len: u16,
        second_start: u16,
        second_len: u16,
    },

    /// A register write carried a value the register cannot hold
    #[error("Invalid register value: {0}")]
    InvalidValue(String),

    /// A waiter for the same correlation key is already registered
    #[error("Duplicate request for context {context} function 0x{function_code:02X}")]
    DuplicateRequest { context: String, function_code: u8 },

    /// The correlation layer was shut down
    #[error("Correlation layer shut down")]
    Shutdown,

    /// Socket level errors other than a closed connection
    #[error("IO error: {0}")]
    Io(String),
}

impl ModbusError {
    /// Create a decoding error carrying the offending PDU
    pub fn decoding(message: impl Into<String>, pdu: &GenericPdu) -> Self {
        Self::Decoding {
            message: message.into(),
            pdu: pdu.clone(),
        }
    }

    /// Create an encoding error
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Whether the error means the transport session is lost
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::Shutdown)
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Self::ConnectionClosed(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Result type alias for the Modbus engine
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;
