//! Voltage Expansion I/O Library
//!
//! Keeps the digital, analog and LED points of a Modbus expansion board in sync
//! with an in-memory state store.
//!
//! # Architecture
//!
//! - **Addressing**: `IoId` (`DO1.2`, `LED1.4`, ...) and its textual codec
//! - **Discovery**: per-group capability probe run once by `Board::connect`
//! - **Polling**: periodic state and counter refresh merged into `StateStore`
//! - **Notification**: `ChangeEvent` broadcast on every observed transition
//! - **Writes**: `WriteVerifier` re-checks every output write against polled state
//! - **Calibration**: board-resident constants for the main analog channel
//!
//! # Features
//!
//! - `modbus` - tokio-modbus TCP transport (default)
//! - `modbus-rtu` - serial RTU transport via tokio-serial

pub mod address;
pub mod board;
pub mod calibration;
pub mod config;
pub mod decoder;
pub mod discovery;
pub mod error;
pub mod poll;
pub mod store;
pub mod transport;
pub mod writer;

// Re-export core types
pub use address::{IoId, IoKind};
pub use board::Board;
pub use calibration::{AnalogCalibrator, AnalogChannel, CalibrationContext};
pub use config::{BoardConfig, CalibrationMap, PollingConfig, RegisterMap, WriteRetryConfig};
pub use discovery::Group;
pub use error::{ExpioError, Result};
pub use poll::TickReport;
pub use store::{ChangeEvent, IoValue};
pub use transport::{BoardSimulator, RegisterTransport, TransportError};
pub use writer::{WriteOutcome, WriteTarget};

#[cfg(feature = "modbus")]
pub use transport::ModbusTransport;
