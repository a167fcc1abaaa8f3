//! Register transport abstraction
//!
//! The synchronization engine only needs three Modbus primitives: read holding
//! registers, write a single coil and write a single register. Any client that
//! can provide them implements [`RegisterTransport`].
//!
//! ```text
//! transport
//!     ├── RegisterTransport (trait consumed by the poller and write verifier)
//!     ├── modbus::ModbusTransport (tokio-modbus TCP / RTU adapter)
//!     └── simulator::BoardSimulator (in-memory register bank)
//! ```

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "modbus")]
pub mod modbus;
pub mod simulator;

#[cfg(feature = "modbus")]
pub use modbus::ModbusTransport;
pub use simulator::BoardSimulator;

/// Failure reported by a transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Device replied with a Modbus exception code
    #[error("Modbus exception code {0}")]
    Exception(u8),

    /// Link or framing failure
    #[error("{0}")]
    Io(String),

    /// No connection available
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Recover an exception code from a client error message
    ///
    /// Some clients only surface a message such as
    /// `"Modbus exception response 2"`; the trailing token (decimal or `0x`
    /// hex) is taken as the exception code. Anything else stays an IO error
    /// with the message kept verbatim.
    pub fn from_message(message: &str) -> Self {
        let code = message
            .split_whitespace()
            .next_back()
            .and_then(parse_code_token);
        match code {
            Some(code) => TransportError::Exception(code),
            None => TransportError::Io(message.to_string()),
        }
    }
}

fn parse_code_token(token: &str) -> Option<u8> {
    let token = token.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

/// Register-level access to one Modbus link
///
/// The unit id is passed with every request; implementations select the slave
/// before issuing the frame.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    /// Read `count` consecutive holding registers starting at `address`
    async fn read_holding_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write a single coil
    async fn write_coil(
        &self,
        unit_id: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError>;

    /// Write a single holding register
    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError>;
}
