//! Expansion I/O Service (expiosrv)
//!
//! Runs one `voltage_expio::Board` against a Modbus TCP, RTU or simulated
//! transport and logs every observed state change.

pub mod config;
pub mod logging;
pub mod runtime;
pub mod shutdown;

pub use config::{load_config, ServiceConfig, TransportConfig};
pub use logging::{init_logging, LogConfig, LogFormat};
