//! tokio-modbus adapter
//!
//! Wraps a `tokio_modbus` client context behind [`RegisterTransport`]. Requests
//! are serialized on the context mutex, so one adapter corresponds to one
//! request/response stream on the wire.

use async_trait::async_trait;
use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use super::{RegisterTransport, TransportError};

/// Modbus client transport (TCP, or RTU with the `modbus-rtu` feature)
pub struct ModbusTransport {
    endpoint: String,
    context: Mutex<Context>,
    request_timeout: Duration,
}

impl std::fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ModbusTransport {
    /// Connect to a Modbus TCP server
    pub async fn connect_tcp(
        addr: SocketAddr,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        debug!("Connecting to Modbus TCP server at {}", addr);

        let context = timeout(request_timeout, tokio_modbus::client::tcp::connect(addr))
            .await
            .map_err(|_| {
                TransportError::Io(format!(
                    "Connection to {} timed out after {} ms",
                    addr,
                    request_timeout.as_millis()
                ))
            })?
            .map_err(|e| TransportError::Io(format!("Failed to connect to {}: {}", addr, e)))?;

        info!("Connected to Modbus TCP server at {}", addr);
        Ok(Self::from_context(context, addr.to_string(), request_timeout))
    }

    /// Open a serial line and attach an RTU client to it
    #[cfg(feature = "modbus-rtu")]
    pub fn connect_rtu(
        path: &str,
        baud_rate: u32,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let builder = tokio_serial::new(path, baud_rate);
        let port = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| TransportError::Io(format!("Failed to open {}: {}", path, e)))?;

        info!("Opened Modbus RTU line {} at {} baud", path, baud_rate);
        let context = tokio_modbus::client::rtu::attach(port);
        Ok(Self::from_context(context, path.to_string(), request_timeout))
    }

    /// Use an already established client context
    pub fn from_context(context: Context, endpoint: String, request_timeout: Duration) -> Self {
        Self {
            endpoint,
            context: Mutex::new(context),
            request_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn timed_out(&self, operation: &str, address: u16) -> TransportError {
        TransportError::Io(format!(
            "{} at {} on {} timed out after {} ms",
            operation,
            address,
            self.endpoint,
            self.request_timeout.as_millis()
        ))
    }
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn read_holding_registers(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut context = self.context.lock().await;
        context.set_slave(Slave(unit_id));
        let response = timeout(
            self.request_timeout,
            context.read_holding_registers(address, count),
        )
        .await
        .map_err(|_| self.timed_out("Read", address))?;
        flatten(response)
    }

    async fn write_coil(
        &self,
        unit_id: u8,
        address: u16,
        value: bool,
    ) -> Result<(), TransportError> {
        let mut context = self.context.lock().await;
        context.set_slave(Slave(unit_id));
        let response = timeout(
            self.request_timeout,
            context.write_single_coil(address, value),
        )
        .await
        .map_err(|_| self.timed_out("Coil write", address))?;
        flatten(response)
    }

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), TransportError> {
        let mut context = self.context.lock().await;
        context.set_slave(Slave(unit_id));
        let response = timeout(
            self.request_timeout,
            context.write_single_register(address, value),
        )
        .await
        .map_err(|_| self.timed_out("Register write", address))?;
        flatten(response)
    }
}

/// Collapse the client's nested result into a structured transport error
fn flatten<T, E: Display>(
    response: Result<Result<T, ExceptionCode>, E>,
) -> Result<T, TransportError> {
    match response {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(TransportError::Exception(exception_code(exception))),
        Err(e) => Err(TransportError::Io(e.to_string())),
    }
}

#[allow(unreachable_patterns)]
fn exception_code(exception: ExceptionCode) -> u8 {
    match exception {
        ExceptionCode::IllegalFunction => 0x01,
        ExceptionCode::IllegalDataAddress => 0x02,
        ExceptionCode::IllegalDataValue => 0x03,
        ExceptionCode::ServerDeviceFailure => 0x04,
        ExceptionCode::Acknowledge => 0x05,
        ExceptionCode::ServerDeviceBusy => 0x06,
        ExceptionCode::MemoryParityError => 0x08,
        ExceptionCode::GatewayPathUnavailable => 0x0A,
        ExceptionCode::GatewayTargetDevice => 0x0B,
        ExceptionCode::Custom(code) => code,
        _ => 0x04,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_codes_match_modbus_table() {
        assert_eq!(exception_code(ExceptionCode::IllegalFunction), 1);
        assert_eq!(exception_code(ExceptionCode::IllegalDataAddress), 2);
        assert_eq!(exception_code(ExceptionCode::ServerDeviceBusy), 6);
        assert_eq!(exception_code(ExceptionCode::GatewayTargetDevice), 11);
        assert_eq!(exception_code(ExceptionCode::Custom(0x07)), 7);
    }

    #[test]
    fn test_flatten_maps_each_layer() {
        let ok: Result<Result<u16, ExceptionCode>, String> = Ok(Ok(5));
        assert_eq!(flatten(ok), Ok(5));

        let exception: Result<Result<u16, ExceptionCode>, String> =
            Ok(Err(ExceptionCode::IllegalDataValue));
        assert_eq!(flatten(exception), Err(TransportError::Exception(3)));

        let io: Result<Result<u16, ExceptionCode>, String> = Err("broken pipe".to_string());
        assert_eq!(
            flatten(io),
            Err(TransportError::Io("broken pipe".to_string()))
        );
    }
}
