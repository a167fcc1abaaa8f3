//! Service runtime
//!
//! ```text
//! open_transport ──> Board::connect ──> Board::start
//!                                          └── change logger (subscribe)
//! shutdown token ──> Board::shutdown
//! ```

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use voltage_expio::{Board, BoardConfig, BoardSimulator, RegisterMap, RegisterTransport};

use crate::config::{ServiceConfig, TransportConfig};

/// Build the transport described by the configuration
pub async fn open_transport(
    transport: &TransportConfig,
    board: &BoardConfig,
) -> Result<Arc<dyn RegisterTransport>> {
    let timeout = board.polling.request_timeout();
    match transport {
        TransportConfig::Tcp { address } => {
            let addr: SocketAddr = address
                .parse()
                .with_context(|| format!("Invalid transport address '{}'", address))?;
            let client = voltage_expio::ModbusTransport::connect_tcp(addr, timeout)
                .await
                .with_context(|| format!("Failed to connect to {}", address))?;
            Ok(Arc::new(client))
        },
        #[cfg(feature = "modbus-rtu")]
        TransportConfig::Rtu { path, baud_rate } => {
            let client = voltage_expio::ModbusTransport::connect_rtu(path, *baud_rate, timeout)
                .with_context(|| format!("Failed to open serial line {}", path))?;
            Ok(Arc::new(client))
        },
        #[cfg(not(feature = "modbus-rtu"))]
        TransportConfig::Rtu { path, .. } => Err(anyhow::anyhow!(
            "RTU transport for {} requires the modbus-rtu feature",
            path
        )),
        TransportConfig::Simulator { groups } => {
            let layout: Vec<(u8, u8)> = groups.iter().map(|g| (g.di, g.do_)).collect();
            info!("Using simulated board with {} groups", layout.len());
            Ok(Arc::new(simulator(&board.registers, &layout)))
        },
    }
}

fn simulator(map: &RegisterMap, layout: &[(u8, u8)]) -> BoardSimulator {
    BoardSimulator::with_layout(map, layout, voltage_expio::discovery::MAIN_BOARD_LEDS)
}

/// Log every change event until the board goes away
pub fn spawn_change_logger(board: &Board) -> JoinHandle<()> {
    let mut events = board.subscribe();
    let name = board.name().to_string();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    board = %name,
                    id = %event.id,
                    value = %event.value,
                    previous = %event.previous,
                    "State changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Change logger for '{}' lagged, {} events skipped", name, skipped);
                },
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Run the board until `shutdown` is cancelled
pub async fn run(config: ServiceConfig, shutdown: CancellationToken) -> Result<()> {
    let transport = open_transport(&config.transport, &config.board).await?;
    let board = Board::connect(config.board.clone(), transport)
        .await
        .context("Board discovery failed")?;

    if board.groups().is_empty() {
        warn!("No groups discovered on board '{}'", board.name());
    }
    for group in board.groups() {
        info!(
            "Group {}: {}",
            group.id,
            serde_json::to_string(group).unwrap_or_default()
        );
    }

    let logger = spawn_change_logger(&board);
    board.start();
    info!("Board '{}' running", board.name());

    shutdown.cancelled().await;
    info!("Shutting down board '{}'", board.name());
    board.shutdown().await;
    logger.abort();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::SimulatedGroup;
    use std::time::Duration;

    #[tokio::test]
    async fn test_simulator_transport_is_discoverable() {
        let transport = TransportConfig::Simulator {
            groups: vec![
                SimulatedGroup { di: 4, do_: 2 },
                SimulatedGroup { di: 8, do_: 8 },
            ],
        };
        let board_config = BoardConfig {
            group_count: 2,
            ..Default::default()
        };
        let client = open_transport(&transport, &board_config).await.unwrap();
        let board = Board::connect(board_config, client).await.unwrap();

        assert_eq!(board.groups().len(), 2);
        assert_eq!(board.groups()[0].do_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_tcp_address() {
        let transport = TransportConfig::Tcp {
            address: "nowhere".to_string(),
        };
        assert!(open_transport(&transport, &BoardConfig::default())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let config = ServiceConfig::default();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(config, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
