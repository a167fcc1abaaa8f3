//! Expansion I/O Error Types
//!
//! Error taxonomy for board synchronization plus the Modbus exception
//! description table used when logging failed register transfers.

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for voltage-expio operations
pub type Result<T> = std::result::Result<T, ExpioError>;

/// Board synchronization errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpioError {
    /// Identifier could not be parsed or was never produced by a poll
    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    /// Device answered with a documented Modbus exception
    #[error("Modbus exception 0x{code:02X}: {description}")]
    ModbusProtocol {
        code: u8,
        description: &'static str,
    },

    /// Transport failure without a documented exception code
    #[error("Transport error: {0}")]
    Transport(String),

    /// Output never matched the requested value
    #[error("Write verification exhausted for {id} after {attempts} attempts")]
    WriteVerificationExhausted { id: String, attempts: u32 },

    /// Calibration registers hold unusable constants
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExpioError {
    pub fn unknown_address(id: impl Into<String>) -> Self {
        ExpioError::UnknownAddress(id.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        ExpioError::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ExpioError::Config(msg.into())
    }

    /// Build the error for a raw exception code, falling back to a verbatim
    /// transport error when the code is not in the table
    pub fn from_exception_code(code: u8) -> Self {
        match exception_description(code) {
            Some(description) => ExpioError::ModbusProtocol { code, description },
            None => ExpioError::Transport(format!("Modbus exception code {}", code)),
        }
    }

    /// Whether the error came from the device or link rather than the caller
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ExpioError::ModbusProtocol { .. } | ExpioError::Transport(_)
        )
    }
}

impl From<TransportError> for ExpioError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Exception(code) => ExpioError::from_exception_code(code),
            TransportError::Io(msg) => ExpioError::Transport(msg),
            TransportError::NotConnected => ExpioError::Transport("Not connected".to_string()),
        }
    }
}

/// Human description of a Modbus exception code (0x01-0x0B)
pub fn exception_description(code: u8) -> Option<&'static str> {
    match code {
        0x01 => Some("Illegal Function"),
        0x02 => Some("Illegal Data Address"),
        0x03 => Some("Illegal Data Value"),
        0x04 => Some("Failure In Associated Device"),
        0x05 => Some("Acknowledge"),
        0x06 => Some("Busy"),
        0x07 => Some("NAK"),
        0x08 => Some("Memory Parity Error"),
        0x0A => Some("Gateway Path Unavailable"),
        0x0B => Some("Gateway Target Failed to Respond"),
        _ => None,
    }
}
