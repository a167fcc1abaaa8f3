//! Service configuration
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. YAML file (`--config`, default `config/expiosrv.yaml`, optional)
//! 3. Environment variables prefixed `EXPIOSRV_`, nested with `__`
//!    (e.g. `EXPIOSRV_BOARD__UNIT_ID=3`)

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use voltage_expio::BoardConfig;

use crate::logging::LogConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/expiosrv.yaml";
pub const ENV_PREFIX: &str = "EXPIOSRV_";

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub log: LogConfig,
    pub transport: TransportConfig,
    pub board: BoardConfig,
}

/// How the board is reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Modbus TCP server or gateway
    Tcp { address: String },
    /// Modbus RTU serial line
    Rtu {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// In-process simulator with the given `(di, do)` counts per group
    Simulator {
        #[serde(default = "default_sim_groups")]
        groups: Vec<SimulatedGroup>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulatedGroup {
    pub di: u8,
    #[serde(rename = "do")]
    pub do_: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_sim_groups() -> Vec<SimulatedGroup> {
    vec![SimulatedGroup { di: 4, do_: 4 }]
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Simulator {
            groups: default_sim_groups(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        self.board.validate()?;
        if let TransportConfig::Tcp { address } = &self.transport {
            address
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("Invalid transport address '{}'", address))?;
        }
        Ok(())
    }
}

/// Layered figment for `path`
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(ServiceConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load and validate the configuration
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file {} not found, using defaults and environment",
            path.display()
        );
    }

    let config: ServiceConfig = figment(path)
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
